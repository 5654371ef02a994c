//! In-memory [`KernelTables`] backend for unit and integration tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use crate::{
    discarder::FilterValue,
    maps::{KernelTables, TableError},
    policy::FilterPolicy,
};

/// Fake kernel tables: only the names passed to [`FakeTables::with_tables`]
/// exist, everything else fails with [`TableError::TableNotFound`].
#[derive(Default)]
pub struct FakeTables {
    known: HashSet<String>,
    policies: Mutex<HashMap<String, FilterPolicy>>,
    values: Mutex<HashMap<String, Vec<FilterValue>>>,
}

impl FakeTables {
    pub fn with_tables(names: &[&str]) -> Self {
        Self {
            known: names.iter().map(|name| name.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn policy(&self, table: &str) -> Option<FilterPolicy> {
        self.policies.lock().unwrap().get(table).copied()
    }

    pub fn values(&self, table: &str) -> Vec<FilterValue> {
        self.values
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self, table: &str) -> Result<(), TableError> {
        if self.known.contains(table) {
            Ok(())
        } else {
            Err(TableError::TableNotFound(table.to_string()))
        }
    }

    fn push(&self, table: &str, value: &FilterValue) -> Result<(), TableError> {
        self.check(table)?;
        self.values
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(value.clone());
        Ok(())
    }
}

impl KernelTables for FakeTables {
    fn write_policy(&self, table: &str, policy: FilterPolicy) -> Result<(), TableError> {
        self.check(table)?;
        self.policies
            .lock()
            .unwrap()
            .insert(table.to_string(), policy);
        Ok(())
    }

    fn insert_discarder(&self, table: &str, value: &FilterValue) -> Result<(), TableError> {
        self.push(table, value)
    }

    fn insert_approver(&self, table: &str, value: &FilterValue) -> Result<(), TableError> {
        self.push(table, value)
    }
}
