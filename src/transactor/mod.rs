//! Per-thread unit of work.
//!
//! A [`Transactor`] is owned by one worker thread and reused for many
//! sequential transactions. It tracks the nodes a transaction touched, owns
//! the staged embedded writes and the relational connections, and runs the
//! commit and abort protocols against the [`NodeManager`].

mod node_ops;

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::key::Key;
use crate::locks::LockOwner;
use crate::manager::NodeManager;
use crate::node::{NodeRef, NodeState};
use crate::store::sql::SqlConnection;
use crate::store::{StoreTxn, IDGEN_RECORD};

/// Nodes with pending changes, in first-touched order.
#[derive(Default)]
struct DirtySet {
    order: Vec<Key>,
    nodes: FxHashMap<Key, NodeRef>,
}

impl DirtySet {
    fn insert(&mut self, key: Key, node: &NodeRef) {
        if !self.nodes.contains_key(&key) {
            self.order.push(key.clone());
            self.nodes.insert(key, Arc::clone(node));
        }
    }

    fn remove(&mut self, key: &Key) -> Option<NodeRef> {
        let node = self.nodes.remove(key)?;
        self.order.retain(|k| k != key);
        Some(node)
    }

    fn ordered(&self) -> Vec<(Key, NodeRef)> {
        self.order
            .iter()
            .filter_map(|k| self.nodes.get(k).map(|n| (k.clone(), Arc::clone(n))))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct TxnState {
    owner: Arc<LockOwner>,
    dirty: DirtySet,
}

/// The part of a transaction visible to its [`KillSwitch`].
struct TxnShared {
    kill_requested: AtomicBool,
    state: Mutex<TxnState>,
}

/// Keys written by one commit.
#[derive(Default)]
struct Changes {
    inserted: Vec<Key>,
    updated: Vec<Key>,
    deleted: Vec<Key>,
}

/// Transaction context of one worker thread.
pub struct Transactor {
    manager: Arc<NodeManager>,
    shared: Arc<TxnShared>,
    name: String,
    started: Option<Instant>,
    clean: FxHashMap<Key, NodeRef>,
    store_txn: Option<StoreTxn>,
    connections: FxHashMap<String, Box<dyn SqlConnection>>,
    temp_ids: AtomicU64,
}

impl Transactor {
    /// An idle transactor bound to `manager`.
    pub fn new(manager: Arc<NodeManager>) -> Self {
        let owner = Arc::new(LockOwner::new(0));
        owner.finish();
        Self {
            manager,
            shared: Arc::new(TxnShared {
                kill_requested: AtomicBool::new(false),
                state: Mutex::new(TxnState {
                    owner,
                    dirty: DirtySet::default(),
                }),
            }),
            name: String::new(),
            started: None,
            clean: FxHashMap::default(),
            store_txn: None,
            connections: FxHashMap::default(),
            temp_ids: AtomicU64::new(1),
        }
    }

    /// Manager this transactor works against.
    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    /// Starts a transaction labelled `name`.
    ///
    /// A transaction still running from an earlier request is aborted first.
    pub fn begin(&mut self, name: impl Into<String>) {
        if self.is_active() {
            warn!(txn = self.id(), name = %self.name, "aborting unfinished transaction");
            self.abort();
        }
        let owner = Arc::new(LockOwner::new(self.manager.next_txn_id()));
        {
            let mut state = self.shared.state.lock();
            state.owner = Arc::clone(&owner);
            state.dirty = DirtySet::default();
        }
        self.shared.kill_requested.store(false, Ordering::Release);
        self.clean.clear();
        self.connections.clear();
        self.store_txn = Some(StoreTxn::new());
        self.name = name.into();
        self.started = Some(Instant::now());
        debug!(txn = owner.id(), name = %self.name, "transaction started");
    }

    /// Id of the current (or last) transaction.
    pub fn id(&self) -> u64 {
        self.shared.state.lock().owner.id()
    }

    /// Label passed to [`Transactor::begin`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a transaction is running and has not been killed.
    pub fn is_active(&self) -> bool {
        self.owner().is_live()
    }

    /// Handle for cancelling the running transaction from another thread.
    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch {
            shared: Arc::clone(&self.shared),
            manager: Arc::clone(&self.manager),
            grace: self.manager.config().kill_grace(),
        }
    }

    fn owner(&self) -> Arc<LockOwner> {
        Arc::clone(&self.shared.state.lock().owner)
    }

    /// Fails with [`StoreError::Killed`] once a kill was requested, aborting
    /// whatever is left of the transaction.
    pub(crate) fn ensure_alive(&mut self) -> Result<()> {
        if self.shared.kill_requested.load(Ordering::Acquire) || self.owner().is_killed() {
            self.abort();
            return Err(StoreError::Killed);
        }
        Ok(())
    }

    /// Records `node` as carrying pending changes.
    pub fn visit_node(&mut self, key: Key, node: &NodeRef) {
        self.clean.remove(&key);
        self.shared.state.lock().dirty.insert(key, node);
    }

    /// Forgets `key` from the dirty set.
    pub fn drop_node(&mut self, key: &Key) -> Option<NodeRef> {
        self.shared.state.lock().dirty.remove(key)
    }

    /// Records `node` as read within this transaction.
    pub fn visit_clean_node(&mut self, key: Key, node: &NodeRef) {
        if !self.shared.state.lock().dirty.nodes.contains_key(&key) {
            self.clean.insert(key, Arc::clone(node));
        }
    }

    /// Node touched by this transaction under `key`, dirty ones first.
    pub fn visited(&self, key: &Key) -> Option<NodeRef> {
        if let Some(node) = self.shared.state.lock().dirty.nodes.get(key) {
            return Some(Arc::clone(node));
        }
        self.clean.get(key).cloned()
    }

    /// Keys with pending changes, in first-touched order.
    pub fn dirty_keys(&self) -> Vec<Key> {
        self.shared.state.lock().dirty.order.clone()
    }

    /// Takes the write lock on `node` for this transaction and records it as
    /// dirty.
    ///
    /// Transient and virtual nodes are never locked. Virtual nodes are still
    /// recorded so that an abort drops the subnode lists changed through them.
    pub fn check_write_lock(&mut self, node: &NodeRef) -> Result<()> {
        let (state, key) = {
            let guard = node.read();
            (guard.state(), guard.key().cloned())
        };
        match state {
            NodeState::Transient => return Ok(()),
            NodeState::Virtual => {
                if let Some(key) = key.filter(|_| self.is_active()) {
                    self.visit_node(key, node);
                }
                return Ok(());
            }
            NodeState::Invalid => {
                return Err(match key {
                    Some(key) => StoreError::InvalidNode(key),
                    None => StoreError::Invalid("invalid node without key"),
                })
            }
            _ => {}
        }
        self.ensure_alive()?;
        if !self.is_active() {
            return Err(StoreError::NoTransaction);
        }
        let key = key.ok_or(StoreError::Invalid("persistent node without key"))?;
        let owner = self.owner();
        if let Err(err) = self.manager.locks().acquire(&key, &owner) {
            self.manager.metrics().conflict();
            warn!(txn = owner.id(), %key, error = %err, "write lock conflict");
            return Err(err);
        }
        self.visit_node(key, node);
        Ok(())
    }

    /// Provisional id for a transient node.
    pub(crate) fn temp_id(&self) -> String {
        format!("t{}", self.temp_ids.fetch_add(1, Ordering::Relaxed))
    }

    /// Connection to `source`, opened on first use in this transaction.
    pub(crate) fn connection(&mut self, source: &str) -> Result<&mut (dyn SqlConnection + 'static)> {
        if !self.connections.contains_key(source) {
            let conn = self.manager.connect(source)?;
            debug!(source, "connection opened");
            self.connections.insert(source.to_owned(), conn);
        }
        self.connections
            .get_mut(source)
            .map(|conn| conn.as_mut())
            .ok_or(StoreError::Invalid("connection vanished"))
    }

    /// Staged embedded writes of the running transaction.
    pub(crate) fn store_txn(&mut self) -> Result<&mut StoreTxn> {
        self.store_txn.as_mut().ok_or(StoreError::NoTransaction)
    }

    /// Writes every dirty node and commits the embedded store.
    ///
    /// On failure the transaction is aborted and the error returned.
    pub fn commit(&mut self) -> Result<()> {
        if !self.is_active() {
            if self.owner().is_killed() {
                self.abort();
                return Err(StoreError::Killed);
            }
            return Err(StoreError::NoTransaction);
        }
        self.ensure_alive()?;

        let dirty = self.shared.state.lock().dirty.ordered();
        let mut changes = Changes::default();
        if let Err(err) = self.write_all(&dirty, &mut changes) {
            warn!(txn = self.id(), name = %self.name, error = %err, "commit failed");
            self.manager.idgen().mark_dirty();
            self.abort();
            return Err(err);
        }

        let mut storages = FxHashSet::default();
        for (key, node) in &dirty {
            let state = node.read().state();
            match state {
                NodeState::Deleted => {
                    self.manager.cache().remove_if_same(key, node);
                }
                NodeState::New | NodeState::Modified => {
                    node.write().mark_clean();
                    self.manager.cache().put(key.clone(), Arc::clone(node));
                }
                _ => continue,
            }
            if let Some(storage) = key.storage() {
                storages.insert(storage.to_owned());
            }
        }
        if !storages.is_empty() {
            self.manager.bump_stamps(storages.iter().map(String::as_str));
        }

        let owner = self.owner();
        owner.finish();
        self.manager.locks().release_all(owner.id());
        self.shared.state.lock().dirty = DirtySet::default();
        self.clean.clear();
        self.connections.clear();

        let metrics = self.manager.metrics();
        changes.inserted.iter().for_each(|_| metrics.node_inserted());
        changes.updated.iter().for_each(|_| metrics.node_updated());
        changes.deleted.iter().for_each(|_| metrics.node_deleted());
        metrics.txn_committed();
        self.manager
            .notify_listeners(&changes.inserted, &changes.updated, &changes.deleted);

        let elapsed = self.started.map(|t| t.elapsed()).unwrap_or_default();
        info!(
            txn = owner.id(),
            name = %self.name,
            inserted = changes.inserted.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "transaction committed"
        );
        if elapsed > self.manager.config().slow_txn_warn() {
            warn!(txn = owner.id(), name = %self.name, elapsed_ms = elapsed.as_millis() as u64, "slow transaction");
        }
        Ok(())
    }

    fn write_all(&mut self, dirty: &[(Key, NodeRef)], changes: &mut Changes) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        for (key, node) in dirty {
            let state = node.read().state();
            match state {
                NodeState::New => {
                    manager.insert_node(self, node)?;
                    changes.inserted.push(key.clone());
                }
                NodeState::Modified => {
                    if manager.update_node(self, node)? {
                        changes.updated.push(key.clone());
                    }
                }
                NodeState::Deleted => {
                    manager.delete_node(self, node)?;
                    changes.deleted.push(key.clone());
                }
                NodeState::Invalid => return Err(StoreError::InvalidNode(key.clone())),
                _ => {}
            }
        }
        if let Some(bytes) = manager.idgen().take_dirty_record()? {
            self.store_txn()?.put(IDGEN_RECORD, bytes);
        }
        if let Some(staged) = self.store_txn.take() {
            if !staged.is_empty() {
                manager.store().commit(staged)?;
            }
        }
        Ok(())
    }

    /// Discards the running transaction.
    ///
    /// Every dirty node is evicted from the cache and must be re-fetched;
    /// locks are released and connections closed.
    pub fn abort(&mut self) {
        let (owner, dirty) = {
            let mut state = self.shared.state.lock();
            (Arc::clone(&state.owner), mem::take(&mut state.dirty))
        };
        let was_running = owner.is_active();
        for (_, node) in dirty.ordered() {
            self.manager.evict_node(&node);
        }
        owner.finish();
        self.manager.locks().release_all(owner.id());
        self.store_txn = None;
        self.connections.clear();
        self.clean.clear();
        if was_running {
            self.manager.metrics().txn_aborted();
            info!(txn = owner.id(), name = %self.name, evicted = dirty.order.len(), "transaction aborted");
        }
    }
}

impl Drop for Transactor {
    fn drop(&mut self) {
        if self.is_active() {
            self.abort();
        }
    }
}

/// Cancels a transaction from another thread.
///
/// The owning thread sees [`StoreError::Killed`] at its next mutation or
/// commit. If the transaction is still running after the grace period, its
/// dirty nodes are evicted and its locks released immediately.
#[derive(Clone)]
pub struct KillSwitch {
    shared: Arc<TxnShared>,
    manager: Arc<NodeManager>,
    grace: Duration,
}

impl KillSwitch {
    /// Requests cancellation and waits up to the grace period.
    ///
    /// Returns `true` when the transaction had to be terminated forcibly.
    pub fn kill(&self) -> bool {
        self.shared.kill_requested.store(true, Ordering::Release);
        let owner = Arc::clone(&self.shared.state.lock().owner);
        if !owner.is_live() {
            return false;
        }
        warn!(txn = owner.id(), grace_ms = self.grace.as_millis() as u64, "kill requested");

        let deadline = Instant::now() + self.grace;
        loop {
            if !owner.is_active() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }

        owner.kill();
        let dirty = mem::take(&mut self.shared.state.lock().dirty);
        for (_, node) in dirty.ordered() {
            self.manager.evict_node(&node);
        }
        let released = self.manager.locks().release_all(owner.id());
        self.manager.metrics().txn_aborted();
        warn!(txn = owner.id(), evicted = dirty.order.len(), released, "transaction killed");
        true
    }

    /// Whether cancellation has been requested.
    pub fn is_requested(&self) -> bool {
        self.shared.kill_requested.load(Ordering::Acquire)
    }
}
