use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::key::Key;
use crate::node::{NodeRef, NodeState};

const MIN_CAPACITY: NonZeroUsize = NonZeroUsize::MIN;

/// Process-wide object cache shared by all transactions.
///
/// Every operation runs under one mutex, so racing loaders of the same key
/// agree on a single winning instance through
/// [`NodeCache::put_if_absent_or_invalid`].
pub struct NodeCache {
    inner: Mutex<LruCache<Key, NodeRef>>,
}

impl NodeCache {
    /// Cache holding at most `capacity` nodes.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(MIN_CAPACITY);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached node for `key`, refreshing its recency.
    pub fn get(&self, key: &Key) -> Option<NodeRef> {
        self.inner.lock().get(key).map(Arc::clone)
    }

    /// Cached node for `key` without touching recency.
    pub fn peek(&self, key: &Key) -> Option<NodeRef> {
        self.inner.lock().peek(key).map(Arc::clone)
    }

    /// Unconditionally caches `node` under `key`, returning the replaced node.
    pub fn put(&self, key: Key, node: NodeRef) -> Option<NodeRef> {
        self.inner.lock().put(key, node)
    }

    /// Caches `node` unless a valid node is already present.
    ///
    /// Returns the node that ended up in the cache: either `node` or the
    /// instance another loader registered first.
    pub fn put_if_absent_or_invalid(&self, key: Key, node: NodeRef) -> NodeRef {
        let mut guard = self.inner.lock();
        if let Some(existing) = guard.get(&key) {
            if existing.read().state() != NodeState::Invalid {
                return Arc::clone(existing);
            }
        }
        guard.put(key, Arc::clone(&node));
        node
    }

    /// Removes the entry for `key`.
    pub fn remove(&self, key: &Key) -> Option<NodeRef> {
        self.inner.lock().pop(key)
    }

    /// Removes `key` only if it still maps to `node`.
    pub fn remove_if_same(&self, key: &Key, node: &NodeRef) -> bool {
        let mut guard = self.inner.lock();
        match guard.peek(key) {
            Some(existing) if Arc::ptr_eq(existing, node) => {
                guard.pop(key);
                true
            }
            _ => false,
        }
    }

    /// Removes and returns every entry for which `evict` returns true.
    pub fn drain_where<F>(&self, mut evict: F) -> Vec<(Key, NodeRef)>
    where
        F: FnMut(&Key, &NodeRef) -> bool,
    {
        let mut guard = self.inner.lock();
        let doomed: Vec<Key> = guard
            .iter()
            .filter(|(key, node)| evict(key, node))
            .map(|(key, _)| key.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| guard.pop(&key).map(|node| (key, node)))
            .collect()
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached nodes.
    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
