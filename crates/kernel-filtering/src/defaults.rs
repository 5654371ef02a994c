//! Default in-kernel filter installers, registered explicitly while the
//! probe is composed.

use std::sync::Arc;

use argus_core::event::{Event, EventKind};

use crate::{
    approver::{ApproverRegistry, Approvers},
    discarder::{Discarder, DiscarderRegistryBuilder, FilterError, FilterValue},
    maps::KernelTables,
};

pub const OPEN_PATH_DISCARDERS: &str = "open_path_discarders";
pub const UNLINK_PATH_DISCARDERS: &str = "unlink_path_discarders";
pub const OPEN_BASENAME_APPROVERS: &str = "open_basename_approvers";
pub const OPEN_FLAGS_APPROVERS: &str = "open_flags_approvers";

/// Discarder functions for the event types supporting kernel-side discard
/// tables. The returned builder can be extended before `build`.
pub fn default_discarders(tables: Arc<dyn KernelTables>) -> DiscarderRegistryBuilder {
    DiscarderRegistryBuilder::default()
        .on(
            EventKind::Open,
            path_discarder(tables.clone(), "open.filename", OPEN_PATH_DISCARDERS),
        )
        .on(
            EventKind::Unlink,
            path_discarder(tables, "unlink.filename", UNLINK_PATH_DISCARDERS),
        )
}

/// Approver installers: only `open` has kernel fast-path tables.
pub fn default_approvers(tables: Arc<dyn KernelTables>) -> ApproverRegistry {
    ApproverRegistry::builder()
        .on(EventKind::Open, open_approvers(tables))
        .build()
}

fn path_discarder(
    tables: Arc<dyn KernelTables>,
    field: &'static str,
    table: &'static str,
) -> impl Fn(&Event, &Discarder) -> Result<(), FilterError> {
    move |_event, discarder| {
        if discarder.field != field {
            return Err(FilterError::UnsupportedField(discarder.field.clone()));
        }
        match &discarder.value {
            FilterValue::Path(path) | FilterValue::Str(path) => {
                tables.insert_discarder(table, &FilterValue::Path(path.clone()))?;
                Ok(())
            }
            value @ FilterValue::Int(_) => Err(FilterError::UnexpectedValue {
                field: discarder.field.clone(),
                value: value.clone(),
            }),
        }
    }
}

fn open_approvers(tables: Arc<dyn KernelTables>) -> impl Fn(&Approvers) -> Result<(), FilterError> {
    move |approvers| {
        for (field, values) in approvers.iter() {
            match field {
                "open.filename" | "open.basename" => {
                    for value in values {
                        match value {
                            FilterValue::Str(_) | FilterValue::Path(_) => {
                                tables.insert_approver(OPEN_BASENAME_APPROVERS, value)?
                            }
                            FilterValue::Int(_) => {
                                return Err(FilterError::UnexpectedValue {
                                    field: field.to_string(),
                                    value: value.clone(),
                                })
                            }
                        }
                    }
                }
                "open.flags" => {
                    for value in values {
                        match value {
                            FilterValue::Int(_) => {
                                tables.insert_approver(OPEN_FLAGS_APPROVERS, value)?
                            }
                            _ => {
                                return Err(FilterError::UnexpectedValue {
                                    field: field.to_string(),
                                    value: value.clone(),
                                })
                            }
                        }
                    }
                }
                other => return Err(FilterError::UnsupportedField(other.to_string())),
            }
        }
        Ok(())
    }
}
