//! The persistent object: identity, state, properties and children.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::handle::NodeHandle;
use crate::key::Key;
use crate::mapping::DbMapping;
use crate::subnodes::Subnodes;
use crate::value::{Property, Value};

/// Shared reference to a node living in the cache or a transaction.
pub type NodeRef = Arc<RwLock<Node>>;

/// Lifecycle state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Lives in memory only and has no key yet.
    Transient,
    /// Has a key and will be inserted on commit.
    New,
    /// Matches the backend.
    Clean,
    /// Has pending changes.
    Modified,
    /// Will be removed on commit.
    Deleted,
    /// Evicted; must be re-fetched before it can be written.
    Invalid,
    /// Synthesized container that is never persisted.
    Virtual,
}

impl NodeState {
    /// Whether the node has been assigned a key.
    pub fn is_persistent(self) -> bool {
        !matches!(self, NodeState::Transient)
    }
}

/// A node of the object graph.
///
/// Mutation goes through [`crate::Transactor`], which takes the write lock
/// and records the node in its dirty set before calling the setters here.
#[derive(Debug)]
pub struct Node {
    id: String,
    name: Option<String>,
    prototype: Option<String>,
    mapping: Option<Arc<DbMapping>>,
    key: Option<Key>,
    state: NodeState,
    created: i64,
    last_modified: i64,
    parent: Option<NodeHandle>,
    subnodes: Option<Subnodes>,
    subnodes_stamp: u64,
    properties: BTreeMap<String, Property>,
    cleared: Vec<String>,
    anonymous: bool,
    name_dirty: bool,
    subnode_filter: Option<String>,
    cache_values: FxHashMap<String, Value>,
}

impl Node {
    /// A transient node with a provisional id.
    pub fn transient(
        id: impl Into<String>,
        prototype: Option<String>,
        mapping: Option<Arc<DbMapping>>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            name: None,
            prototype,
            mapping,
            key: None,
            state: NodeState::Transient,
            created: now,
            last_modified: now,
            parent: None,
            subnodes: None,
            subnodes_stamp: 0,
            properties: BTreeMap::new(),
            cleared: Vec::new(),
            anonymous: true,
            name_dirty: false,
            subnode_filter: None,
            cache_values: FxHashMap::default(),
        }
    }

    /// A node loaded from a backend, in state `Clean`.
    pub(crate) fn loaded(
        key: Key,
        prototype: Option<String>,
        mapping: Option<Arc<DbMapping>>,
        properties: BTreeMap<String, Property>,
    ) -> Self {
        let mut node = Node::transient(key.id().to_owned(), prototype, mapping);
        node.key = Some(key);
        node.state = NodeState::Clean;
        node.properties = properties;
        node
    }

    /// A synthesized container node addressed by a synthetic key.
    pub(crate) fn virtual_node(
        key: Key,
        name: String,
        mapping: Arc<DbMapping>,
        parent: NodeHandle,
    ) -> Self {
        let mut node = Node::transient(key.id().to_owned(), mapping.prototype().map(str::to_owned), Some(mapping));
        node.key = Some(key);
        node.name = Some(name);
        node.state = NodeState::Virtual;
        node.parent = Some(parent);
        node.anonymous = false;
        node
    }

    /// Wraps the node for sharing.
    pub fn into_ref(self) -> NodeRef {
        Arc::new(RwLock::new(self))
    }

    /// Assigns the permanent id and key.
    pub(crate) fn assign_identity(&mut self, id: impl Into<String>, key: Key, state: NodeState) {
        self.id = id.into();
        self.key = Some(key);
        self.state = state;
    }

    /// Id of the node (provisional while transient).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Key of the node once it has one.
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Human readable name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Replaces the name, returning the previous one.
    pub(crate) fn set_name_raw(&mut self, name: Option<String>) -> Option<String> {
        if self.name != name {
            self.name_dirty = true;
        }
        std::mem::replace(&mut self.name, name)
    }

    pub(crate) fn name_dirty(&self) -> bool {
        self.name_dirty
    }

    /// Prototype (type) name.
    pub fn prototype(&self) -> Option<&str> {
        self.prototype.as_deref()
    }

    /// Mapping describing how this node is stored.
    pub fn mapping(&self) -> Option<&Arc<DbMapping>> {
        self.mapping.as_ref()
    }

    /// Whether the node lives in a relational table.
    pub fn is_relational(&self) -> bool {
        self.mapping.as_ref().is_some_and(|m| m.is_relational())
    }

    /// Lifecycle state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    /// Moves a clean node to `Modified` and bumps its modification time.
    pub(crate) fn mark_modified(&mut self) {
        if self.state == NodeState::Clean {
            self.state = NodeState::Modified;
        }
        self.last_modified = now_millis();
    }

    /// Marks every cell as persisted after a successful commit.
    pub(crate) fn mark_clean(&mut self) {
        self.state = NodeState::Clean;
        self.name_dirty = false;
        self.cleared.clear();
        self.properties.values_mut().for_each(Property::mark_clean);
    }

    /// Creation time in milliseconds since the epoch.
    pub fn created(&self) -> i64 {
        self.created
    }

    /// Last modification time in milliseconds since the epoch.
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub(crate) fn set_timestamps(&mut self, created: i64, last_modified: i64) {
        self.created = created;
        self.last_modified = last_modified;
    }

    /// Explicitly known parent.
    pub fn parent(&self) -> Option<&NodeHandle> {
        self.parent.as_ref()
    }

    pub(crate) fn set_parent(&mut self, parent: Option<NodeHandle>) {
        self.parent = parent;
    }

    /// Whether the node is reached from its parent by id rather than by name.
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub(crate) fn set_anonymous(&mut self, anonymous: bool) {
        self.anonymous = anonymous;
    }

    /// Stored property cell.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Stored property value.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).map(Property::value)
    }

    /// All stored property cells.
    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    /// Sets a property cell, returning whether the value changed.
    pub(crate) fn put_value(&mut self, name: &str, value: Value) -> bool {
        self.cleared.retain(|c| c != name);
        match self.properties.get_mut(name) {
            Some(prop) => prop.set(value),
            None => {
                self.properties
                    .insert(name.to_owned(), Property::new(name, value));
                true
            }
        }
    }

    /// Removes a property; the removal is written out on the next update.
    pub(crate) fn clear_value(&mut self, name: &str) -> Option<Property> {
        let removed = self.properties.remove(name);
        if removed.is_some() && !self.cleared.iter().any(|c| c == name) {
            self.cleared.push(name.to_owned());
        }
        removed
    }

    /// Properties removed since the last commit.
    pub(crate) fn cleared(&self) -> &[String] {
        &self.cleared
    }

    /// The child list, if it has been materialized.
    pub fn subnodes(&self) -> Option<&Subnodes> {
        self.subnodes.as_ref()
    }

    pub(crate) fn subnodes_mut(&mut self) -> &mut Option<Subnodes> {
        &mut self.subnodes
    }

    pub(crate) fn take_subnodes(&mut self) -> Option<Subnodes> {
        self.subnodes.take()
    }

    pub(crate) fn put_subnodes(&mut self, subnodes: Subnodes, stamp: u64) {
        self.subnodes = Some(subnodes);
        self.subnodes_stamp = stamp;
    }

    /// Data-change stamp at which the child list was fetched.
    pub(crate) fn subnodes_stamp(&self) -> u64 {
        self.subnodes_stamp
    }

    /// Extra SQL condition restricting this node's children.
    pub fn subnode_filter(&self) -> Option<&str> {
        self.subnode_filter.as_deref()
    }

    /// Overrides the child condition for this node and drops the fetched list.
    pub fn set_subnode_filter(&mut self, filter: Option<String>) {
        self.subnode_filter = filter;
        self.subnodes = None;
    }

    /// Scratch values owned by the application layer; never persisted.
    pub fn cache_values(&mut self) -> &mut FxHashMap<String, Value> {
        &mut self.cache_values
    }
}

/// Wall clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_node_becomes_modified_then_clean() {
        let mut node = Node::loaded(
            Key::embedded("5"),
            Some("page".into()),
            None,
            BTreeMap::new(),
        );
        assert_eq!(node.state(), NodeState::Clean);
        assert!(node.put_value("title", Value::from("hello")));
        node.mark_modified();
        assert_eq!(node.state(), NodeState::Modified);
        assert!(node.property("title").is_some_and(Property::is_dirty));
        node.mark_clean();
        assert_eq!(node.state(), NodeState::Clean);
        assert!(!node.property("title").is_some_and(Property::is_dirty));
    }

    #[test]
    fn new_nodes_stay_new_when_modified() {
        let mut node = Node::transient("t1", None, None);
        node.assign_identity("9", Key::embedded("9"), NodeState::New);
        node.mark_modified();
        assert_eq!(node.state(), NodeState::New);
        assert_eq!(node.id(), "9");
    }

    #[test]
    fn cache_values_are_separate_from_properties() {
        let mut node = Node::transient("t1", None, None);
        node.cache_values().insert("hits".into(), Value::Int(3));
        assert!(node.value("hits").is_none());
        assert_eq!(node.cache_values().get("hits"), Some(&Value::Int(3)));
    }
}
