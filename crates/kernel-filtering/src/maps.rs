//! Typed access to the kernel-resident filtering tables.

use std::{collections::HashMap as StdHashMap, sync::Mutex};

use probe_common::aya::{
    maps::{Array, HashMap, Map},
    Ebpf, Pod,
};
use thiserror::Error;

use crate::{
    discarder::FilterValue,
    policy::{FilterPolicy, RawFilterPolicy},
};

/// Fixed sentinel key of the single-slot policy tables.
pub const POLICY_KEY: u32 = 0;

/// Fixed size of string and path keys in discarder/approver tables. Keys are
/// zero-padded, so the value itself must be shorter.
pub const VALUE_KEY_LEN: usize = 256;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("unable to find table `{0}`")]
    TableNotFound(String),
    #[error("value of {len} bytes is too long for a key of table `{table}`")]
    ValueTooLong { table: String, len: usize },
    #[error("write to table `{table}` failed")]
    WriteFailed {
        table: String,
        #[source]
        source: probe_common::aya::maps::MapError,
    },
}

/// Narrow write interface to the kernel-resident filtering state.
///
/// The policy applier and the default discarder/approver functions only
/// ever push through this trait; tests provide an in-memory implementation.
pub trait KernelTables: Send + Sync {
    /// Write the policy record at the fixed sentinel key; last writer wins.
    fn write_policy(&self, table: &str, policy: FilterPolicy) -> Result<(), TableError>;

    /// Mark a value as discarded in the given per-event-type table.
    fn insert_discarder(&self, table: &str, value: &FilterValue) -> Result<(), TableError>;

    /// Add a value to a kernel fast-path approver table.
    fn insert_approver(&self, table: &str, value: &FilterValue) -> Result<(), TableError>;
}

/// `aya`-backed implementation writing to the maps of a loaded [`Ebpf`].
///
/// The maps are taken out of the `Ebpf` handle once at setup; a table the
/// kernel-side programs don't define simply stays absent and surfaces as
/// [`TableError::TableNotFound`] on the first write.
pub struct EbpfTables {
    tables: StdHashMap<String, Mutex<Map>>,
}

impl EbpfTables {
    pub fn take_from(bpf: &mut Ebpf, names: &[&str]) -> Self {
        let mut tables = StdHashMap::new();
        for name in names {
            match bpf.take_map(name) {
                Some(map) => {
                    tables.insert(name.to_string(), Mutex::new(map));
                }
                None => log::debug!("filtering table `{name}` is not defined by this probe"),
            }
        }
        Self { tables }
    }

    fn table(&self, name: &str) -> Result<&Mutex<Map>, TableError> {
        self.tables
            .get(name)
            .ok_or_else(|| TableError::TableNotFound(name.to_string()))
    }

    fn insert_value(&self, table: &str, value: &FilterValue) -> Result<(), TableError> {
        let key = ValueKey::encode(table, value)?;
        let mut map = self.table(table)?.lock().unwrap();
        let mut map: HashMap<_, ValueKey, u8> =
            HashMap::try_from(&mut *map).map_err(|source| TableError::WriteFailed {
                table: table.to_string(),
                source,
            })?;
        map.insert(key, 1u8, 0)
            .map_err(|source| TableError::WriteFailed {
                table: table.to_string(),
                source,
            })
    }
}

impl KernelTables for EbpfTables {
    fn write_policy(&self, table: &str, policy: FilterPolicy) -> Result<(), TableError> {
        let mut map = self.table(table)?.lock().unwrap();
        let mut array: Array<_, RawFilterPolicy> =
            Array::try_from(&mut *map).map_err(|source| TableError::WriteFailed {
                table: table.to_string(),
                source,
            })?;
        array
            .set(POLICY_KEY, policy.as_raw(), 0)
            .map_err(|source| TableError::WriteFailed {
                table: table.to_string(),
                source,
            })
    }

    fn insert_discarder(&self, table: &str, value: &FilterValue) -> Result<(), TableError> {
        self.insert_value(table, value)
    }

    fn insert_approver(&self, table: &str, value: &FilterValue) -> Result<(), TableError> {
        self.insert_value(table, value)
    }
}

/// Zero-padded fixed-size key for the discarder and approver hash tables,
/// matching the kernel-side key layout.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ValueKey {
    buf: [u8; VALUE_KEY_LEN],
}

unsafe impl Pod for ValueKey {}

impl ValueKey {
    fn encode(table: &str, value: &FilterValue) -> Result<Self, TableError> {
        let mut buf = [0u8; VALUE_KEY_LEN];
        match value {
            FilterValue::Str(s) | FilterValue::Path(s) => {
                let bytes = s.as_bytes();
                if bytes.len() >= VALUE_KEY_LEN {
                    return Err(TableError::ValueTooLong {
                        table: table.to_string(),
                        len: bytes.len(),
                    });
                }
                buf[..bytes.len()].copy_from_slice(bytes);
            }
            FilterValue::Int(n) => buf[..8].copy_from_slice(&n.to_le_bytes()),
        }
        Ok(Self { buf })
    }
}
