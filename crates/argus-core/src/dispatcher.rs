//! Per-buffer orchestration: decode, update the resolution caches, count,
//! notify the consumer.

use std::sync::Arc;

use bytes::Bytes;
use probe_common::{log_error, RawEventHandler};
use tokio::sync::mpsc;

use crate::{
    codec,
    event::{Event, Payload},
    resolvers::Resolvers,
    stats::EventStats,
};

/// Consumer of decoded events, registered once at composition time.
///
/// `handle_event` runs on the per-CPU reader tasks and must not block.
pub trait EventConsumer: Send + Sync + 'static {
    fn handle_event(&self, event: Event);
}

/// Simple implementation for tokio::mpsc bounded channels.
/// Sending with full channel will drop messages.
impl EventConsumer for mpsc::Sender<Event> {
    fn handle_event(&self, event: Event) {
        if self.try_send(event).is_err() {
            log::warn!("dropping msg");
        }
    }
}

/// Drives the decoding data path for every per-CPU callback.
///
/// The dispatcher is cheap to clone (shared handles); every buffer decodes
/// into a fresh [`Event`], so concurrently executing callbacks never share
/// mutable decode state.
#[derive(Clone)]
pub struct Dispatcher {
    resolvers: Arc<Resolvers>,
    stats: Arc<EventStats>,
    consumer: Arc<dyn EventConsumer>,
}

impl Dispatcher {
    pub fn new(
        resolvers: Arc<Resolvers>,
        stats: Arc<EventStats>,
        consumer: Arc<dyn EventConsumer>,
    ) -> Self {
        Self {
            resolvers,
            stats,
            consumer,
        }
    }

    /// Process one raw buffer. Failures are terminal for this buffer only:
    /// on a decode error nothing is counted and the consumer is not
    /// notified, the event never happened from the system's point of view.
    pub fn on_buffer(&self, cpu_id: u32, data: &[u8]) {
        let (event, _read) = match codec::decode(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                log_error(
                    &format!("failed to decode event (cpu {cpu_id}, len {})", data.len()),
                    err,
                );
                return;
            }
        };

        match &event.payload {
            Payload::Mount(record) => {
                // Insertion happens strictly after resolution: the cache
                // must only ever contain fully resolved entries.
                match self.resolvers.mounts().resolve(record) {
                    Ok(entry) => self.resolvers.mounts().insert(entry),
                    Err(err) => {
                        log::warn!("failed to resolve mount point {}: {err}", record.mount_id)
                    }
                }
            }
            Payload::Umount { mount_id } => {
                if let Err(err) = self.resolvers.mounts().delete(*mount_id) {
                    log::error!("failed to delete mount point {mount_id} from cache: {err}");
                }
            }
            _ => {}
        }

        self.stats.count_event(event.payload.kind());
        log::trace!("dispatching {} event", event.header.kind);
        self.consumer.handle_event(event);
    }

    /// The kernel transport could not deliver `count` buffers. Only the lost
    /// counter moves; per-type counters are untouched.
    pub fn on_lost(&self, cpu_id: u32, count: u64) {
        log::warn!("lost {count} events on cpu {cpu_id}");
        self.stats.count_lost(count);
    }
}

impl RawEventHandler for Dispatcher {
    fn deliver(&self, cpu_id: u32, buffer: Bytes) {
        self.on_buffer(cpu_id, &buffer);
    }

    fn lost(&self, cpu_id: u32, count: u64) {
        self.on_lost(cpu_id, count);
    }
}
