//! The coordinating object cache and backend dispatcher.
//!
//! Every read of a node goes through [`NodeManager`]: first the calling
//! transaction's visited set, then the shared [`NodeCache`], then the embedded
//! store or a relational data source. Writes are issued by the
//! [`Transactor`] at commit time through the `*_node` methods here.

mod fetch;
mod sql;
mod write;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::cache::NodeCache;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::handle::NodeHandle;
use crate::idgen::IdGenerator;
use crate::key::Key;
use crate::locks::LockTable;
use crate::mapping::{DbMapping, IdStrategy, MappingRegistry, Relation, RelationKind};
use crate::metrics::{default_metrics, StoreMetrics};
use crate::node::{Node, NodeRef, NodeState};
use crate::resolve::{column_types, resolve_record, ColumnTypes};
use crate::store::sql::{DataSource, SqlConnection, SqlValue, SqliteDataSource};
use crate::store::{EmbeddedStore, FileStore, MemoryStore, NodeRecord, StoreTxn, IDGEN_RECORD};
use crate::transactor::Transactor;
use crate::value::Value;

pub(crate) use fetch::local_value;

/// Id of the application root node.
pub const ROOT_ID: &str = "0";
/// Id of the node holding the users.
pub const USER_ROOT_ID: &str = "1";

/// Receives the keys written by every successful commit.
pub trait NodeChangeListener: Send + Sync {
    /// Called once per commit, after the backends have accepted it.
    fn nodes_changed(&self, inserted: &[Key], updated: &[Key], deleted: &[Key]);
}

/// The single authority between application code and the backing stores.
pub struct NodeManager {
    config: StoreConfig,
    registry: RwLock<Arc<MappingRegistry>>,
    cache: NodeCache,
    locks: LockTable,
    store: Arc<dyn EmbeddedStore>,
    sources: FxHashMap<String, Arc<dyn DataSource>>,
    idgen: IdGenerator,
    sql_ids: Mutex<FxHashMap<String, i64>>,
    stamps: Mutex<FxHashMap<String, u64>>,
    stamp_clock: AtomicU64,
    columns: Mutex<FxHashMap<(String, String), Arc<ColumnTypes>>>,
    listeners: RwLock<Vec<Arc<dyn NodeChangeListener>>>,
    metrics: Arc<dyn StoreMetrics>,
    next_txn: AtomicU64,
}

impl NodeManager {
    /// Opens the stores described by `config`.
    ///
    /// The embedded store lives under `embedded_path` (in memory when unset),
    /// type mappings are read from `schema` and every configured data source
    /// is opened as a SQLite database.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn EmbeddedStore> = match &config.embedded_path {
            Some(dir) => Arc::new(FileStore::open(dir)?),
            None => Arc::new(MemoryStore::new()),
        };
        let registry = match &config.schema {
            Some(path) => MappingRegistry::load(path)?,
            None => MappingRegistry::default(),
        };
        let sources: Vec<Arc<dyn DataSource>> = config
            .data_sources
            .iter()
            .map(|(name, ds)| Arc::new(SqliteDataSource::new(name.clone(), &ds.url)) as Arc<dyn DataSource>)
            .collect();
        let mut manager = Self::new(config, store, registry)?;
        for source in sources {
            manager = manager.with_data_source(source);
        }
        Ok(manager)
    }

    /// Manager over an existing embedded store and schema.
    ///
    /// Creates the root and user root records when the store lacks them.
    pub fn new(
        config: StoreConfig,
        store: Arc<dyn EmbeddedStore>,
        registry: MappingRegistry,
    ) -> Result<Self> {
        let idgen = IdGenerator::from_record(store.get(IDGEN_RECORD)?.as_deref())?;
        ensure_reserved_records(store.as_ref())?;
        info!(
            types = registry.mappings().count(),
            cache_capacity = config.cache_capacity,
            next_id = idgen.current() + 1,
            "node manager opened"
        );
        Ok(Self {
            cache: NodeCache::new(config.cache_capacity),
            config,
            registry: RwLock::new(Arc::new(registry)),
            locks: LockTable::new(),
            store,
            sources: FxHashMap::default(),
            idgen,
            sql_ids: Mutex::new(FxHashMap::default()),
            stamps: Mutex::new(FxHashMap::default()),
            stamp_clock: AtomicU64::new(1),
            columns: Mutex::new(FxHashMap::default()),
            listeners: RwLock::new(Vec::new()),
            metrics: default_metrics(),
            next_txn: AtomicU64::new(1),
        })
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn StoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registers a relational data source under its name.
    pub fn with_data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.insert(source.name().to_owned(), source);
        self
    }

    /// Adds a commit listener.
    pub fn add_listener(&self, listener: Arc<dyn NodeChangeListener>) {
        self.listeners.write().push(listener);
    }

    /// Settings the manager was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current schema generation.
    pub fn registry(&self) -> Arc<MappingRegistry> {
        Arc::clone(&self.registry.read())
    }

    /// Mapping of `type_name` in the current schema.
    pub fn mapping(&self, type_name: &str) -> Option<Arc<DbMapping>> {
        self.registry.read().get(type_name).cloned()
    }

    /// Mapping of `type_name`, or an embedded mapping for undeclared types.
    pub fn mapping_or_embedded(&self, type_name: &str) -> Arc<DbMapping> {
        self.mapping(type_name)
            .unwrap_or_else(|| Arc::new(DbMapping::embedded(type_name)))
    }

    /// Shared object cache.
    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Write lock table.
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn StoreMetrics> {
        &self.metrics
    }

    /// Embedded store.
    pub fn store(&self) -> &Arc<dyn EmbeddedStore> {
        &self.store
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn idgen(&self) -> &IdGenerator {
        &self.idgen
    }

    pub(crate) fn connect(&self, source: &str) -> Result<Box<dyn SqlConnection>> {
        self.sources
            .get(source)
            .ok_or_else(|| StoreError::Config(format!("unknown data source {source}")))?
            .connect()
    }

    /// Data source holding the table of `mapping`.
    pub(crate) fn source_name(&self, mapping: &DbMapping) -> Result<String> {
        if let Some(name) = mapping.data_source() {
            return Ok(name.to_owned());
        }
        let mut names = self.sources.keys();
        match (names.next(), names.next()) {
            (Some(only), None) => Ok(only.clone()),
            _ => Err(StoreError::Config(format!(
                "{} does not name a data source",
                mapping.type_name()
            ))),
        }
    }

    /// Column types of the table of `mapping`, introspected once.
    pub(crate) fn column_types(
        &self,
        txn: &mut Transactor,
        mapping: &DbMapping,
    ) -> Result<Arc<ColumnTypes>> {
        let table = mapping
            .table()
            .ok_or_else(|| StoreError::Schema(format!("{} has no table", mapping.type_name())))?;
        let source = self.source_name(mapping)?;
        let cache_key = (source.clone(), table.to_ascii_uppercase());
        if let Some(types) = self.columns.lock().get(&cache_key) {
            return Ok(Arc::clone(types));
        }
        let columns = txn.connection(&source)?.columns(table)?;
        let types = Arc::new(column_types(&columns));
        self.columns.lock().insert(cache_key, Arc::clone(&types));
        Ok(types)
    }

    /// Caches `node` under its key, replacing any previous entry.
    pub fn register_node(&self, node: &NodeRef) -> Option<NodeRef> {
        let key = node.read().key().cloned()?;
        self.cache.put(key, Arc::clone(node))
    }

    /// Removes `node` from the cache and marks it invalid.
    pub fn evict_node(&self, node: &NodeRef) {
        let key = {
            let mut guard = node.write();
            if guard.state() != NodeState::Transient {
                guard.set_state(NodeState::Invalid);
            }
            guard.key().cloned()
        };
        if let Some(key) = key {
            self.cache.remove_if_same(&key, node);
            debug!(%key, "node evicted");
        }
    }

    /// Drops the cache entry for `key` without touching the node.
    pub fn evict_key(&self, key: &Key) -> Option<NodeRef> {
        self.cache.remove(key)
    }

    /// Node reachable under `key` through the transaction or the cache.
    pub(crate) fn lookup(&self, txn: &Transactor, key: &Key) -> Option<NodeRef> {
        if let Some(node) = txn.visited(key) {
            return Some(node);
        }
        let node = self.cache.get(key)?;
        if node.read().state() == NodeState::Invalid {
            return None;
        }
        Some(node)
    }

    /// Resolves a top-level node by primary key.
    ///
    /// Returns `Ok(None)` when no such node exists.
    pub fn get_node(
        &self,
        txn: &mut Transactor,
        id: &str,
        mapping: &Arc<DbMapping>,
    ) -> Result<Option<NodeRef>> {
        let key = Key::db(mapping.storage_name(), id);
        if let Some(node) = self.lookup(txn, &key) {
            self.metrics.cache_hit();
            txn.visit_clean_node(key, &node);
            return Ok(live(node));
        }
        self.metrics.cache_miss();
        let loaded = if mapping.is_relational() {
            self.load_row(txn, mapping, id)?.map(|(_, node)| node)
        } else {
            self.load_record(id)?
        };
        let Some(node) = loaded else {
            debug!(%key, "node not found");
            return Ok(None);
        };
        let node = self.cache.put_if_absent_or_invalid(key.clone(), node);
        txn.visit_clean_node(key, &node);
        Ok(live(node))
    }

    /// Resolves a node by key.
    ///
    /// Synthetic keys are only answered from the transaction or the cache.
    pub fn get_node_by_key(&self, txn: &mut Transactor, key: &Key) -> Result<Option<NodeRef>> {
        match key.storage() {
            _ if key.is_synthetic() => {
                let found = self.lookup(txn, key);
                if let Some(node) = &found {
                    txn.visit_clean_node(key.clone(), node);
                }
                Ok(found.and_then(live))
            }
            None => {
                let mapping = Arc::new(DbMapping::embedded(""));
                self.get_node(txn, key.id(), &mapping)
            }
            Some(storage) => {
                let mapping = self
                    .registry
                    .read()
                    .for_storage(storage)
                    .cloned()
                    .ok_or_else(|| StoreError::Schema(format!("unknown storage {storage}")))?;
                self.get_node(txn, key.id(), &mapping)
            }
        }
    }

    /// Resolves a node reached from `home` through `rel`.
    ///
    /// `value` is the group name for group-by relations, the child name for
    /// collections and the stored column value for references. Virtual
    /// relations ignore it.
    pub fn get_node_by_relation(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        value: &str,
        rel: &Arc<Relation>,
    ) -> Result<Option<NodeRef>> {
        let home_key = home
            .read()
            .key()
            .cloned()
            .ok_or(StoreError::Invalid("relation lookup from a transient node"))?;

        if rel.is_virtual() {
            let mapping = rel
                .virtual_mapping()
                .cloned()
                .ok_or_else(|| StoreError::Schema(format!("{} lacks a virtual mapping", rel.prop_name())))?;
            let key = Key::synthetic(&home_key, rel.prop_name());
            return Ok(Some(self.virtual_node(txn, key, rel.prop_name(), mapping, home)));
        }

        if let Some(group_mapping) = rel.group_mapping().cloned() {
            let key = Key::synthetic(&home_key, value);
            if let Some(node) = self.lookup(txn, &key) {
                return Ok(Some(node));
            }
            if self.count_group_members(txn, home, rel, value)? == 0 {
                return Ok(None);
            }
            return Ok(Some(self.virtual_node(txn, key, value, group_mapping, home)));
        }

        let target = self.target_mapping(rel)?;
        match rel.kind() {
            RelationKind::Reference if rel.uses_primary_key() => self.get_node(txn, value, &target),
            RelationKind::Reference => {
                let column = rel
                    .constraints()
                    .first()
                    .map(|c| c.foreign.clone())
                    .ok_or_else(|| StoreError::Schema(format!("{} has no foreign column", rel.prop_name())))?;
                let secondary = Key::synthetic(&home_key, rel.prop_name());
                self.get_by_secondary(txn, secondary, &target, &column, value, None)
            }
            RelationKind::Collection if rel.is_relational() => {
                let column = rel
                    .accessor()
                    .or(target.id_column())
                    .map(str::to_owned)
                    .ok_or_else(|| StoreError::Schema(format!("{} has no accessor", rel.prop_name())))?;
                let secondary = Key::synthetic(&home_key, value);
                self.get_by_secondary(txn, secondary, &target, &column, value, Some((home, rel)))
            }
            _ => Ok(None),
        }
    }

    /// Cached or freshly synthesized container node.
    pub(crate) fn virtual_node(
        &self,
        txn: &mut Transactor,
        key: Key,
        name: &str,
        mapping: Arc<DbMapping>,
        home: &NodeRef,
    ) -> NodeRef {
        if let Some(node) = self.lookup(txn, &key) {
            return node;
        }
        let node = Node::virtual_node(key.clone(), name.to_owned(), mapping, NodeHandle::for_node(home)).into_ref();
        let node = self.cache.put_if_absent_or_invalid(key.clone(), node);
        txn.visit_clean_node(key, &node);
        node
    }

    fn get_by_secondary(
        &self,
        txn: &mut Transactor,
        secondary: Key,
        target: &Arc<DbMapping>,
        column: &str,
        value: &str,
        children_of: Option<(&NodeRef, &Arc<Relation>)>,
    ) -> Result<Option<NodeRef>> {
        if let Some(node) = self.lookup(txn, &secondary) {
            let matches = fetch::local_value(&node.read(), column).is_some_and(|v| v.to_text() == value);
            if matches {
                return Ok(live(node));
            }
            self.cache.remove_if_same(&secondary, &node);
        }
        let types = self.column_types(txn, target)?;
        let mut filter = match children_of {
            Some((home, rel)) => self.child_filter(txn, home, rel, target, &types)?,
            None => sql::Filter::new(),
        };
        filter.eq(
            column,
            crate::resolve::value_to_sql(&Value::from(value), types.get(&column.to_ascii_uppercase()).copied()),
        );
        let Some((key, node)) = self.fetch_first(txn, target, filter, &types)? else {
            return Ok(None);
        };
        let node = match self.lookup(txn, &key) {
            Some(existing) => existing,
            None => self.cache.put_if_absent_or_invalid(key.clone(), node),
        };
        self.cache.put(secondary, Arc::clone(&node));
        txn.visit_clean_node(key, &node);
        Ok(live(node))
    }

    fn load_record(&self, id: &str) -> Result<Option<NodeRef>> {
        let Some(bytes) = self.store.get(id)? else {
            return Ok(None);
        };
        let resolved = resolve_record(NodeRecord::from_bytes(&bytes)?);
        let mapping = resolved
            .prototype
            .as_deref()
            .and_then(|proto| self.mapping(proto));
        self.metrics.node_loaded();
        Ok(Some(resolved.into_node(Key::embedded(id), mapping)))
    }

    /// Fresh id for an embedded node.
    pub fn generate_id(&self) -> String {
        self.idgen.next_id()
    }

    /// Fresh primary key for a row of `mapping`.
    pub fn generate_sql_id(&self, txn: &mut Transactor, mapping: &DbMapping) -> Result<String> {
        let table = mapping
            .table()
            .ok_or_else(|| StoreError::Schema(format!("{} has no table", mapping.type_name())))?;
        let source = self.source_name(mapping)?;
        match mapping.id_strategy() {
            IdStrategy::Embedded => Ok(self.generate_id()),
            IdStrategy::Sequence(query) => {
                let rows = txn.connection(&source)?.query(query, &[])?;
                rows.first()
                    .and_then(|row| row.value(0))
                    .and_then(SqlValue::to_text)
                    .ok_or_else(|| StoreError::Sql(format!("sequence query returned nothing: {query}")))
            }
            IdStrategy::Max => {
                let id_column = mapping.id_column().unwrap_or("ID");
                let sql = format!("SELECT MAX({id_column}) FROM {table}");
                let rows = txn.connection(&source)?.query(&sql, &[])?;
                let db_max = rows
                    .first()
                    .and_then(|row| row.value(0))
                    .and_then(SqlValue::to_text)
                    .and_then(|text| text.parse::<i64>().ok())
                    .unwrap_or(0);
                let storage = mapping.storage_name().unwrap_or(table).to_owned();
                let mut issued = self.sql_ids.lock();
                let last = issued.entry(storage).or_insert(0);
                *last = (*last).max(db_max) + 1;
                Ok(last.to_string())
            }
        }
    }

    /// Logical time of the last committed change to `storage`.
    pub fn data_stamp(&self, storage: &str) -> u64 {
        self.stamps.lock().get(storage).copied().unwrap_or(1)
    }

    pub(crate) fn bump_stamps<'a>(&self, storages: impl IntoIterator<Item = &'a str>) {
        let tick = self.stamp_clock.fetch_add(1, Ordering::AcqRel) + 1;
        let mut stamps = self.stamps.lock();
        for storage in storages {
            stamps.insert(storage.to_owned(), tick);
        }
    }

    /// Swaps in a new schema generation.
    ///
    /// Every cached virtual or group node is evicted, as is every node whose
    /// type definition changed. Returns the number of evicted nodes.
    pub fn reload_schema(&self, text: &str) -> Result<usize> {
        let next = {
            let current = self.registry.read();
            current.reload(text)?
        };
        let next = Arc::new(next);
        *self.registry.write() = Arc::clone(&next);
        self.columns.lock().clear();

        let evicted = self.cache.drain_where(|key, node| {
            if key.is_synthetic() {
                return true;
            }
            let guard = node.read();
            match guard.mapping() {
                Some(old) => next
                    .get(old.type_name())
                    .map_or(true, |current| current.stamp() != old.stamp()),
                None => false,
            }
        });
        for (_, node) in &evicted {
            let mut guard = node.write();
            if !matches!(guard.state(), NodeState::Transient | NodeState::New) {
                guard.set_state(NodeState::Invalid);
            }
        }
        info!(generation = next.generation(), evicted = evicted.len(), "schema reloaded");
        Ok(evicted.len())
    }

    pub(crate) fn notify_listeners(&self, inserted: &[Key], updated: &[Key], deleted: &[Key]) {
        if inserted.is_empty() && updated.is_empty() && deleted.is_empty() {
            return;
        }
        for listener in self.listeners.read().iter() {
            listener.nodes_changed(inserted, updated, deleted);
        }
    }
}

fn live(node: NodeRef) -> Option<NodeRef> {
    if node.read().state() == NodeState::Deleted {
        None
    } else {
        Some(node)
    }
}

fn ensure_reserved_records(store: &dyn EmbeddedStore) -> Result<()> {
    let mut txn = StoreTxn::new();
    for (id, prototype, name, parent) in [
        (ROOT_ID, "Root", None, None),
        (USER_ROOT_ID, "UserRoot", Some("users"), Some(Key::embedded(ROOT_ID))),
    ] {
        if store.get(id)?.is_some() {
            continue;
        }
        let now = crate::node::now_millis();
        let record = NodeRecord {
            id: id.to_owned(),
            name: name.map(str::to_owned),
            prototype: Some(prototype.to_owned()),
            parent,
            created: now,
            last_modified: now,
            anonymous: false,
            subnodes: Vec::new(),
            properties: Default::default(),
        };
        txn.put(id, record.to_bytes()?);
    }
    if !txn.is_empty() {
        info!(records = txn.len(), "creating reserved records");
        store.commit(txn)?;
    }
    Ok(())
}
