use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hooks for observing cache and transaction activity.
pub trait StoreMetrics: Send + Sync {
    /// A lookup was answered from the shared cache.
    fn cache_hit(&self);

    /// A lookup had to go to a backend.
    fn cache_miss(&self);

    /// A node was read from a backend.
    fn node_loaded(&self);

    /// A node was inserted on commit.
    fn node_inserted(&self);

    /// A node was updated on commit.
    fn node_updated(&self);

    /// A node was deleted on commit.
    fn node_deleted(&self);

    /// A write lock request hit a live holder.
    fn conflict(&self);

    /// A transaction committed.
    fn txn_committed(&self);

    /// A transaction aborted or was killed.
    fn txn_aborted(&self);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn cache_hit(&self) {}
    fn cache_miss(&self) {}
    fn node_loaded(&self) {}
    fn node_inserted(&self) {}
    fn node_updated(&self) {}
    fn node_deleted(&self) {}
    fn conflict(&self) {}
    fn txn_committed(&self) {}
    fn txn_aborted(&self) {}
}

/// Atomic counters, safe to read from any thread.
#[derive(Default, Debug)]
pub struct CounterMetrics {
    /// Cache hits.
    pub cache_hits: AtomicU64,
    /// Cache misses.
    pub cache_misses: AtomicU64,
    /// Nodes read from a backend.
    pub nodes_loaded: AtomicU64,
    /// Nodes inserted.
    pub nodes_inserted: AtomicU64,
    /// Nodes updated.
    pub nodes_updated: AtomicU64,
    /// Nodes deleted.
    pub nodes_deleted: AtomicU64,
    /// Write lock conflicts.
    pub conflicts: AtomicU64,
    /// Committed transactions.
    pub txns_committed: AtomicU64,
    /// Aborted transactions.
    pub txns_aborted: AtomicU64,
}

impl CounterMetrics {
    /// Reads one counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

impl StoreMetrics for CounterMetrics {
    fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn node_loaded(&self) {
        self.nodes_loaded.fetch_add(1, Ordering::Relaxed);
    }

    fn node_inserted(&self) {
        self.nodes_inserted.fetch_add(1, Ordering::Relaxed);
    }

    fn node_updated(&self) {
        self.nodes_updated.fetch_add(1, Ordering::Relaxed);
    }

    fn node_deleted(&self) {
        self.nodes_deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_committed(&self) {
        self.txns_committed.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_aborted(&self) {
        self.txns_aborted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Metrics used when none are configured: [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn StoreMetrics> {
    Arc::new(NoopMetrics)
}
