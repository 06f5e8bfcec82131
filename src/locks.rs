use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::key::Key;

/// Identity and liveness of one transaction as seen by the lock table.
#[derive(Debug)]
pub struct LockOwner {
    id: u64,
    active: AtomicBool,
    killed: AtomicBool,
}

impl LockOwner {
    /// A live owner for transaction `id`.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            active: AtomicBool::new(true),
            killed: AtomicBool::new(false),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the transaction is still running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether the transaction was forcibly terminated.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Whether locks held by this owner still exclude others.
    pub fn is_live(&self) -> bool {
        self.is_active() && !self.is_killed()
    }

    /// Marks the transaction as finished.
    pub fn finish(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Marks the transaction as forcibly terminated.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }
}

/// Advisory write locks keyed by node key.
///
/// A lock records which transaction owns pending changes to a node. Locks of
/// finished or killed transactions are stale and are taken over silently.
#[derive(Default)]
pub struct LockTable {
    held: Mutex<FxHashMap<Key, Arc<LockOwner>>>,
}

impl LockTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the write lock on `key` for `owner`.
    ///
    /// Fails with [`StoreError::Conflict`] when another live transaction
    /// holds it.
    pub fn acquire(&self, key: &Key, owner: &Arc<LockOwner>) -> Result<()> {
        let mut held = self.held.lock();
        if let Some(current) = held.get(key) {
            if current.id() != owner.id() && current.is_live() {
                return Err(StoreError::Conflict {
                    key: key.clone(),
                    holder: current.id(),
                });
            }
        }
        trace!(%key, txn = owner.id(), "write lock acquired");
        held.insert(key.clone(), Arc::clone(owner));
        Ok(())
    }

    /// Releases `key` if `owner` holds it.
    pub fn release(&self, key: &Key, owner: u64) {
        let mut held = self.held.lock();
        if held.get(key).is_some_and(|o| o.id() == owner) {
            held.remove(key);
        }
    }

    /// Releases every lock held by `owner`, returning how many were held.
    pub fn release_all(&self, owner: u64) -> usize {
        let mut held = self.held.lock();
        let before = held.len();
        held.retain(|_, o| o.id() != owner);
        before - held.len()
    }

    /// Transaction currently holding a live lock on `key`.
    pub fn holder(&self, key: &Key) -> Option<u64> {
        self.held
            .lock()
            .get(key)
            .filter(|o| o.is_live())
            .map(|o| o.id())
    }

    /// Number of recorded locks, stale ones included.
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    /// Whether no locks are recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
