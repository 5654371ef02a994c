//! The [`RawEventHandler`] trait is how [`crate::Program`] hands the raw
//! per-CPU buffers to the decoding layer.
//!
//! Both callbacks run on the per-CPU reader tasks and must not block.

use bytes::Bytes;

pub trait RawEventHandler: Clone + Send + 'static {
    /// Called once per event buffer read from a per-CPU ring buffer.
    /// Ordering is guaranteed only between buffers coming from the same CPU.
    fn deliver(&self, cpu_id: u32, buffer: Bytes);

    /// Called when the kernel reports buffers it could not deliver.
    fn lost(&self, cpu_id: u32, count: u64);
}
