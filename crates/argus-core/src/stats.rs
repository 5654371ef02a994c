//! Counters for received and lost events.
//!
//! The aggregator is shared between all per-CPU callbacks, so every counter
//! is a relaxed atomic: increments from concurrent callbacks are never lost
//! and never serialize the hot path.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use strum::{EnumCount, IntoEnumIterator};

use crate::event::EventKind;

/// Prefix of the metrics exported by the probe.
pub const METRIC_PREFIX: &str = "argus.runtime_security";

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Outbound sink for the periodic destructive stats export. The transport
/// behind it is out of scope for this crate.
pub trait MetricSink {
    fn count(&mut self, name: &str, value: u64, tags: &[(&str, &str)]) -> Result<(), SinkError>;
}

pub struct EventStats {
    per_event_type: [AtomicU64; EventKind::COUNT],
    lost: AtomicU64,
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStats {
    pub fn new() -> Self {
        Self {
            per_event_type: std::array::from_fn(|_| AtomicU64::new(0)),
            lost: AtomicU64::new(0),
        }
    }

    pub fn count_event(&self, kind: EventKind) {
        self.per_event_type[kind.ordinal()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_lost(&self, count: u64) {
        self.lost.fetch_add(count, Ordering::Relaxed);
    }

    pub fn get(&self, kind: EventKind) -> u64 {
        self.per_event_type[kind.ordinal()].load(Ordering::Relaxed)
    }

    /// Read and zero the counter in one atomic step, so no increment racing
    /// with the reset is ever dropped.
    pub fn get_and_reset(&self, kind: EventKind) -> u64 {
        self.per_event_type[kind.ordinal()].swap(0, Ordering::Relaxed)
    }

    pub fn get_lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn get_and_reset_lost(&self) -> u64 {
        self.lost.swap(0, Ordering::Relaxed)
    }

    /// Non-destructive snapshot of every counter, used for on-demand
    /// inspection. The destructive export path is [`EventStats::send`].
    pub fn snapshot(&self, syscalls: Option<serde_json::Value>) -> StatsSnapshot {
        StatsSnapshot {
            events: GlobalStats {
                lost: self.get_lost(),
                syscalls,
            },
            per_event_type: EventKind::iter().map(|kind| (kind.to_string(), self.get(kind))).collect(),
        }
    }

    /// Destructive export of all counters to `sink`, tagged by event type.
    /// Event types with no events since the last export are skipped.
    pub fn send(&self, sink: &mut dyn MetricSink) -> Result<(), SinkError> {
        sink.count(&format!("{METRIC_PREFIX}.events.lost"), self.get_and_reset_lost(), &[])?;

        let received = format!("{METRIC_PREFIX}.events.received");
        for kind in EventKind::iter() {
            let value = self.get_and_reset(kind);
            if value > 0 {
                let kind = kind.to_string();
                sink.count(&received, value, &[("event_type", &kind)])?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub events: GlobalStats,
    pub per_event_type: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct GlobalStats {
    pub lost: u64,
    pub syscalls: Option<serde_json::Value>,
}
