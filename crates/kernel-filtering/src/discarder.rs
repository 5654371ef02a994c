//! Discarders: dynamic "stop delivering this" instructions pushed to the
//! kernel when rule evaluation discovers a field value no rule can match.

use std::{collections::HashMap, fmt};

use argus_core::event::{Event, EventKind};
use thiserror::Error;

use crate::maps::TableError;

/// Value kinds the rule-engine field space can produce. Discarder and
/// approver functions match on these exhaustively instead of downcasting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Str(String),
    Int(u64),
    Path(String),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Str(s) => write!(f, "\"{s}\""),
            FilterValue::Int(n) => write!(f, "{n}"),
            FilterValue::Path(p) => write!(f, "{p}"),
        }
    }
}

/// A (field, value) pair meaning "future events where this field equals
/// this value should be suppressed before reaching userspace".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discarder {
    /// Rule-engine field identifier, e.g. `open.filename`.
    pub field: String,
    pub value: FilterValue,
}

#[derive(Error, Debug)]
pub enum FilterError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("field `{field}` has no in-kernel filter for value {value}")]
    UnexpectedValue { field: String, value: FilterValue },
    #[error("unsupported field `{0}`")]
    UnsupportedField(String),
}

pub type DiscarderFn = Box<dyn Fn(&Event, &Discarder) -> Result<(), FilterError> + Send + Sync>;

/// Per-event-type registry of discarder functions.
///
/// Built once during probe composition and read-only afterwards: reads from
/// rule evaluation may run concurrently with event delivery.
pub struct DiscarderRegistry {
    enabled: bool,
    fns: HashMap<EventKind, Vec<DiscarderFn>>,
}

impl DiscarderRegistry {
    pub fn builder() -> DiscarderRegistryBuilder {
        DiscarderRegistryBuilder::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Invoke every discarder registered for `kind`, in registration order.
    ///
    /// The first failure aborts the remaining functions and is propagated:
    /// a partially applied discarder is an accepted outcome, never retried
    /// here. When discarders are disabled this is a guaranteed no-op.
    pub fn notify(
        &self,
        kind: EventKind,
        event: &Event,
        discarder: &Discarder,
    ) -> Result<(), FilterError> {
        if !self.enabled {
            return Ok(());
        }
        log::trace!("new discarder for field `{}` on `{kind}`", discarder.field);
        for fnc in self.fns.get(&kind).into_iter().flatten() {
            fnc(event, discarder)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct DiscarderRegistryBuilder {
    fns: HashMap<EventKind, Vec<DiscarderFn>>,
}

impl DiscarderRegistryBuilder {
    pub fn on<F>(mut self, kind: EventKind, fnc: F) -> Self
    where
        F: Fn(&Event, &Discarder) -> Result<(), FilterError> + Send + Sync + 'static,
    {
        self.fns.entry(kind).or_default().push(Box::new(fnc));
        self
    }

    pub fn build(self, enabled: bool) -> DiscarderRegistry {
        DiscarderRegistry {
            enabled,
            fns: self.fns,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    use argus_core::event::{EventHeader, Payload};

    use super::*;

    fn open_event() -> Event {
        Event {
            header: EventHeader {
                kind: EventKind::Open,
                timestamp: 0,
                pid: 1,
                tid: 1,
                retval: 0,
            },
            payload: Payload::Open {
                filename: "etc/hosts".to_string(),
                flags: 0,
                mode: 0,
                mount_id: 1,
            },
        }
    }

    fn discarder() -> Discarder {
        Discarder {
            field: "open.filename".to_string(),
            value: FilterValue::Path("/etc/hosts".to_string()),
        }
    }

    #[test]
    fn first_failure_aborts_the_rest() {
        let second_ran = Arc::new(AtomicBool::new(false));
        let flag = second_ran.clone();
        let registry = DiscarderRegistry::builder()
            .on(EventKind::Open, |_, d| {
                Err(FilterError::UnsupportedField(d.field.clone()))
            })
            .on(EventKind::Open, move |_, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .build(true);

        let err = registry
            .notify(EventKind::Open, &open_event(), &discarder())
            .unwrap_err();
        assert!(matches!(err, FilterError::UnsupportedField(field) if field == "open.filename"));
        assert!(!second_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn functions_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (order.clone(), order.clone());
        let registry = DiscarderRegistry::builder()
            .on(EventKind::Open, move |_, _| {
                first.lock().unwrap().push(1);
                Ok(())
            })
            .on(EventKind::Open, move |_, _| {
                second.lock().unwrap().push(2);
                Ok(())
            })
            .build(true);

        registry
            .notify(EventKind::Open, &open_event(), &discarder())
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn disabled_registry_is_a_no_op() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let registry = DiscarderRegistry::builder()
            .on(EventKind::Open, move |_, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .build(false);

        registry
            .notify(EventKind::Open, &open_event(), &discarder())
            .unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn event_type_without_functions_succeeds() {
        let registry = DiscarderRegistry::builder().build(true);
        registry
            .notify(EventKind::Rename, &open_event(), &discarder())
            .unwrap();
    }
}
