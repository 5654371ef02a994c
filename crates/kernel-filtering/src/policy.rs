//! Coarse per-event-type filtering policy, persisted in single-slot kernel
//! tables.

use argus_core::event::EventKind;
use bitflags::bitflags;

use crate::maps::{KernelTables, TableError};

/// Per-event-type filtering mode applied independently of discarders and
/// approvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u32)]
pub enum PolicyMode {
    NoFilter = 0,
    Accept = 1,
    Deny = 2,
    Monitor = 3,
}

bitflags! {
    /// Which event fields the kernel-side filter consults.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PolicyFlags: u32 {
        const BASENAME = 1;
        const FLAGS = 1 << 1;
        const MODE = 1 << 2;
        const PROCESS_NAME = 1 << 3;
    }
}

/// One record per event type in its kernel policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterPolicy {
    pub mode: PolicyMode,
    pub flags: PolicyFlags,
}

impl FilterPolicy {
    /// Explicit pass-everything policy, written when kernel-side filtering
    /// is disabled so the default never depends on a zero-valued record.
    pub fn pass() -> Self {
        Self {
            mode: PolicyMode::NoFilter,
            flags: PolicyFlags::empty(),
        }
    }

    pub(crate) fn as_raw(&self) -> RawFilterPolicy {
        RawFilterPolicy {
            mode: self.mode as u32,
            flags: self.flags.bits(),
        }
    }
}

/// Kernel-side layout of [`FilterPolicy`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawFilterPolicy {
    pub mode: u32,
    pub flags: u32,
}

unsafe impl probe_common::aya::Pod for RawFilterPolicy {}

/// Conventional name of the single-slot policy table for an event type.
pub fn policy_table_name(kind: EventKind) -> String {
    format!("{kind}_policy")
}

/// Write the in-kernel filter policy for `event_type` into `table_name`,
/// overwriting any previous record.
///
/// A missing table is fatal to enabling filtering for that event type; the
/// caller may keep running in an unfiltered mode.
pub fn apply_filter_policy(
    tables: &dyn KernelTables,
    event_type: EventKind,
    table_name: &str,
    mode: PolicyMode,
    flags: PolicyFlags,
) -> Result<(), TableError> {
    log::info!("Setting in-kernel filter policy to `{mode}` for `{event_type}`");
    tables.write_policy(table_name, FilterPolicy { mode, flags })
}
