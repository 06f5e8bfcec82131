//! Backends: the embedded record store and relational data sources.

mod file;
mod record;
pub mod sql;

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;

pub use file::FileStore;
pub use record::{NodeRecord, RecordValue};

/// Id of the record holding the embedded id counter.
pub const IDGEN_RECORD: &str = "idgen";

/// Writes staged by one transaction against the embedded store.
///
/// Nothing reaches the store until [`EmbeddedStore::commit`]; dropping the
/// transaction discards its writes.
#[derive(Debug, Default)]
pub struct StoreTxn {
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl StoreTxn {
    /// Empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a write of `bytes` under `id`.
    pub fn put(&mut self, id: impl Into<String>, bytes: Vec<u8>) {
        self.writes.insert(id.into(), Some(bytes));
    }

    /// Stages a delete of `id`.
    pub fn delete(&mut self, id: impl Into<String>) {
        self.writes.insert(id.into(), None);
    }

    /// Staged state of `id`: `Some(None)` means staged for deletion.
    pub fn staged(&self, id: &str) -> Option<Option<&[u8]>> {
        self.writes.get(id).map(Option::as_deref)
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub(crate) fn into_writes(self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.writes
    }
}

/// Key-value store holding embedded nodes as encoded records.
pub trait EmbeddedStore: Send + Sync {
    /// Record stored under `id`.
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Ids of all stored records.
    fn ids(&self) -> Result<Vec<String>>;

    /// Applies every write of `txn` atomically with respect to readers.
    fn commit(&self, txn: StoreTxn) -> Result<()>;
}

/// Embedded store kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmbeddedStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn ids(&self) -> Result<Vec<String>> {
        Ok(self.records.read().keys().cloned().collect())
    }

    fn commit(&self, txn: StoreTxn) -> Result<()> {
        let mut records = self.records.write();
        for (id, write) in txn.into_writes() {
            match write {
                Some(bytes) => {
                    records.insert(id, bytes);
                }
                None => {
                    records.remove(&id);
                }
            }
        }
        Ok(())
    }
}
