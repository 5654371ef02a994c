//! Periodic polling of the kernel per-syscall counters.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use argus_core::stats::{MetricSink, SinkError, METRIC_PREFIX};
use probe_common::{
    aya::maps::{HashMap as CountersMap, MapData},
    Program, ProgramError, MAX_SYSCALLS,
};
use serde::Serialize;

const SYSCALLS_MAP: &str = "syscalls";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-syscall event counters, keyed by syscall number. Only nonzero
/// counters are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SyscallStats {
    counts: BTreeMap<u32, u64>,
}

impl SyscallStats {
    pub fn set(&mut self, syscall: u32, count: u64) {
        if count > 0 && (syscall as usize) < MAX_SYSCALLS {
            self.counts.insert(syscall, count);
        }
    }

    pub fn get(&self, syscall: u32) -> u64 {
        self.counts.get(&syscall).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.counts.iter().map(|(syscall, count)| (*syscall, *count))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Holds the latest snapshot of the kernel syscall counters, refreshed by a
/// background polling task.
#[derive(Clone, Default)]
pub struct SyscallMonitor {
    stats: Arc<Mutex<SyscallStats>>,
}

impl SyscallMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_stats(&self) -> SyscallStats {
        self.stats.lock().unwrap().clone()
    }

    /// Start refreshing from the kernel counter map on a fixed interval.
    /// The polling task stops together with the program's other readers.
    pub async fn start(&self, program: &mut Program) -> Result<(), ProgramError> {
        let stats = self.stats.clone();
        program
            .poll(
                SYSCALLS_MAP,
                POLL_INTERVAL,
                move |map: &mut CountersMap<MapData, u32, u64>| {
                    let mut fresh = SyscallStats::default();
                    for entry in map.iter() {
                        match entry {
                            Ok((syscall, count)) => fresh.set(syscall, count),
                            Err(err) => {
                                log::warn!("error reading syscall counters: {err}");
                                return;
                            }
                        }
                    }
                    *stats.lock().unwrap() = fresh;
                },
            )
            .await
    }

    /// Forward the current counters to `sink`, tagged by syscall number.
    pub fn send(&self, sink: &mut dyn MetricSink) -> Result<(), SinkError> {
        let name = format!("{METRIC_PREFIX}.syscalls.count");
        for (syscall, count) in self.get_stats().iter() {
            let syscall = syscall.to_string();
            sink.count(&name, count, &[("syscall", &syscall)])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_nonzero_counters_are_kept() {
        let mut stats = SyscallStats::default();
        stats.set(0, 10);
        stats.set(1, 0);
        stats.set(u32::MAX, 5); // out of the syscall table
        assert_eq!(stats.get(0), 10);
        assert_eq!(stats.get(1), 0);
        assert_eq!(stats.iter().count(), 1);
    }

    #[test]
    fn serializes_as_a_plain_map() {
        let mut stats = SyscallStats::default();
        stats.set(2, 7);
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value, serde_json::json!({ "2": 7 }));
    }
}
