//! Approvers: static fast-path filters derived from a compiled rule set,
//! installed so the kernel can pre-admit events without full evaluation.

use std::collections::HashMap;

use argus_core::event::EventKind;

use crate::{
    discarder::{FilterError, FilterValue},
    policy::PolicyMode,
};

/// Approver values produced by the rule set's static analysis,
/// field identifier → admissible values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Approvers {
    fields: HashMap<String, Vec<FilterValue>>,
}

impl Approvers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, values: Vec<FilterValue>) {
        self.fields.insert(field.into(), values);
    }

    pub fn get(&self, field: &str) -> Option<&[FilterValue]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[FilterValue])> {
        self.fields
            .iter()
            .map(|(field, values)| (field.as_str(), values.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

pub type ApproverFn = Box<dyn Fn(&Approvers) -> Result<(), FilterError> + Send + Sync>;

/// At most one approver installer per event type, registered at composition
/// time and read-only afterwards.
pub struct ApproverRegistry {
    fns: HashMap<EventKind, ApproverFn>,
}

impl ApproverRegistry {
    pub fn builder() -> ApproverRegistryBuilder {
        ApproverRegistryBuilder::default()
    }

    /// Install the approvers for `kind`. An event type with no registered
    /// installer is success with no effect: absence is not an error. A
    /// failing installer is logged with the fallback policy it compromises,
    /// then propagated.
    pub fn apply(&self, kind: EventKind, approvers: &Approvers) -> Result<(), FilterError> {
        let Some(fnc) = self.fns.get(&kind) else {
            return Ok(());
        };
        match fnc(approvers) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!(
                    "error while adding approvers fallback in-kernel policy to `{}` for `{kind}`: {err:?}",
                    PolicyMode::Accept
                );
                Err(err)
            }
        }
    }
}

#[derive(Default)]
pub struct ApproverRegistryBuilder {
    fns: HashMap<EventKind, ApproverFn>,
}

impl ApproverRegistryBuilder {
    /// Register the installer for `kind`, replacing any previous one.
    pub fn on<F>(mut self, kind: EventKind, fnc: F) -> Self
    where
        F: Fn(&Approvers) -> Result<(), FilterError> + Send + Sync + 'static,
    {
        self.fns.insert(kind, Box::new(fnc));
        self
    }

    pub fn build(self) -> ApproverRegistry {
        ApproverRegistry { fns: self.fns }
    }
}
