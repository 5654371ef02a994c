//! # In-kernel event filtering
//!
//! This crate contains the userspace half of the two-tier policy system
//! which reduces event volume at the source:
//!
//! - a coarse per-event-type [`FilterPolicy`] (mode + flags) written to a
//!   single-slot kernel table;
//! - fine-grained predicates pushed down while rules are evaluated:
//!   **discarders** ("never deliver events where this field equals this
//!   value again") and **approvers** (rule-derived fast-path allowlists the
//!   kernel consults before full evaluation).
//!
//! # Policy system requirements
//!
//! - Filtering always happens on kernel side; userspace only pushes
//!   instructions down through [`KernelTables`].
//! - Registries are explicit objects built once during probe composition
//!   and read-only afterwards, so rule (re)compilation may run concurrently
//!   with event delivery.
//! - When kernel-side filtering is disabled by configuration, the effective
//!   policy is an explicit pass-everything record, never an incidental zero
//!   value.

pub mod approver;
pub mod defaults;
pub mod discarder;
pub mod maps;
pub mod policy;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use approver::{ApproverRegistry, ApproverRegistryBuilder, Approvers};
pub use discarder::{
    Discarder, DiscarderRegistry, DiscarderRegistryBuilder, FilterError, FilterValue,
};
pub use maps::{EbpfTables, KernelTables, TableError};
pub use policy::{apply_filter_policy, policy_table_name, FilterPolicy, PolicyFlags, PolicyMode};
