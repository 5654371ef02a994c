//! Decoding data path of the runtime-security probe: the typed event model,
//! the binary codec for the kernel buffers, the resolution caches consulted
//! while decoding, the event counters and the per-buffer dispatcher.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod resolvers;
pub mod stats;

pub use dispatcher::{Dispatcher, EventConsumer};
pub use event::{Event, EventKind, Payload};
pub use stats::{EventStats, MetricSink, StatsSnapshot, METRIC_PREFIX};
