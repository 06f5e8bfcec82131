//! Node reads and mutations performed inside a transaction.
//!
//! Every mutator takes the node's write lock through
//! [`Transactor::check_write_lock`] before touching it. Node guards are never
//! held across calls into the manager, so lookups issued while a child list
//! is being rebuilt cannot deadlock on the node being rebuilt.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::debug;

use super::Transactor;
use crate::error::{Result, StoreError};
use crate::handle::NodeHandle;
use crate::key::Key;
use crate::manager::{local_value, ROOT_ID, USER_ROOT_ID};
use crate::mapping::{ParentInfo, Relation, RelationKind, NAME_COLUMN};
use crate::node::{Node, NodeRef, NodeState};
use crate::subnodes::{
    OrderSpec, OrderedSubnodeList, SegmentedSubnodeList, SortRow, SubnodeList, Subnodes,
    UpdateableSubnodeList,
};
use crate::value::{Value, ValueKind};

impl Transactor {
    /// A transient node of type `prototype`.
    ///
    /// It stays in memory until it is attached to a persistent node or passed
    /// to [`Transactor::make_persistable`].
    pub fn create_node(&self, prototype: &str, name: Option<&str>) -> NodeRef {
        let mapping = self.manager.mapping_or_embedded(prototype);
        let mut node = Node::transient(self.temp_id(), Some(prototype.to_owned()), Some(mapping));
        if let Some(name) = name {
            node.set_name_raw(Some(name.to_owned()));
            node.set_anonymous(false);
        }
        node.into_ref()
    }

    /// Top-level node of `type_name` with primary key `id`.
    pub fn get_node(&mut self, id: &str, type_name: &str) -> Result<Option<NodeRef>> {
        let mapping = self.manager.mapping_or_embedded(type_name);
        let manager = Arc::clone(&self.manager);
        manager.get_node(self, id, &mapping)
    }

    /// Node addressed by `key`.
    ///
    /// Synthetic keys that are no longer cached are rebuilt from their parent.
    pub fn get_node_by_key(&mut self, key: &Key) -> Result<Option<NodeRef>> {
        let manager = Arc::clone(&self.manager);
        if let Some(node) = manager.get_node_by_key(self, key)? {
            return Ok(Some(node));
        }
        let (Some(parent_key), Key::Synthetic(synthetic)) = (key.parent(), key) else {
            return Ok(None);
        };
        let Some(parent) = self.get_node_by_key(parent_key)? else {
            return Ok(None);
        };
        let Some(mapping) = parent.read().mapping().cloned() else {
            return Ok(None);
        };
        let name = synthetic.name.as_str();
        if let Some(rel) = mapping.relation(name).filter(|r| r.is_virtual()) {
            return manager.get_node_by_relation(self, &parent, name, rel);
        }
        match mapping.subnode_relation() {
            Some(rel) if rel.is_relational() => manager.get_node_by_relation(self, &parent, name, rel),
            _ => Ok(None),
        }
    }

    /// Node a handle points at; `None` when it no longer exists.
    pub fn resolve(&mut self, handle: &NodeHandle) -> Result<Option<NodeRef>> {
        if let Some(node) = handle.direct() {
            let state = node.read().state();
            if !matches!(state, NodeState::Invalid | NodeState::Deleted) {
                return Ok(Some(Arc::clone(node)));
            }
        }
        match handle.key() {
            Some(key) => self.get_node_by_key(&key),
            None => Ok(None),
        }
    }

    /// The application root node.
    pub fn root(&mut self) -> Result<NodeRef> {
        self.get_node(ROOT_ID, "Root")?
            .ok_or_else(|| StoreError::InvalidNode(Key::embedded(ROOT_ID)))
    }

    /// The node holding the users.
    pub fn user_root(&mut self) -> Result<NodeRef> {
        self.get_node(USER_ROOT_ID, "UserRoot")?
            .ok_or_else(|| StoreError::InvalidNode(Key::embedded(USER_ROOT_ID)))
    }

    /// Value of property `name`.
    ///
    /// Stored cells are returned first; references that no longer resolve read
    /// as `None`. Virtual properties and references by a non-key column are
    /// resolved through the mapping. With `inherit`, missing properties are
    /// looked up along the parent chain.
    pub fn get_property(&mut self, node: &NodeRef, name: &str, inherit: bool) -> Result<Option<Value>> {
        let (stored, mapping, keyed) = {
            let guard = node.read();
            (
                guard.value(name).cloned(),
                guard.mapping().cloned(),
                guard.key().is_some(),
            )
        };
        let rel = mapping.as_ref().and_then(|m| m.relation(name).cloned());
        let manager = Arc::clone(&self.manager);

        if let Some(value) = stored {
            if let Value::Node(handle) = &value {
                return Ok(self.resolve(handle)?.map(|_| value));
            }
            return match rel {
                Some(rel) if keyed && rel.kind() == RelationKind::Reference && !rel.uses_primary_key() => {
                    let target = manager.get_node_by_relation(self, node, &value.to_text(), &rel)?;
                    Ok(target.map(|n| Value::Node(NodeHandle::for_node(&n))))
                }
                _ => Ok(Some(value)),
            };
        }

        if let Some(rel) = rel.filter(|r| r.is_virtual() && keyed) {
            let target = manager.get_node_by_relation(self, node, name, &rel)?;
            return Ok(target.map(|n| Value::Node(NodeHandle::for_node(&n))));
        }

        if inherit {
            if let Some(parent) = self.parent_of(node)? {
                return self.get_property(&parent, name, true);
            }
        }
        Ok(None)
    }

    /// Node-valued property `name`, resolved.
    pub fn get_node_property(&mut self, node: &NodeRef, name: &str) -> Result<Option<NodeRef>> {
        match self.get_property(node, name, false)? {
            Some(Value::Node(handle)) => self.resolve(&handle),
            _ => Ok(None),
        }
    }

    /// Sets property `name` to `value`.
    ///
    /// Fails with [`StoreError::TypeMismatch`] when the value does not fit the
    /// relation declared for `name` or is a NaN or infinite float. A node value
    /// without a parent is adopted by `node`, and a transient one is persisted
    /// along with it.
    pub fn set_property(&mut self, node: &NodeRef, name: &str, value: Value) -> Result<()> {
        if matches!(value, Value::Float(f) if !f.is_finite()) {
            return Err(StoreError::TypeMismatch {
                property: name.to_owned(),
                expected: "a finite number",
            });
        }
        let rel = node.read().mapping().and_then(|m| m.relation(name).cloned());
        if let Some(rel) = &rel {
            check_value(rel, &value)?;
        }
        self.check_write_lock(node)?;
        let (changed, key) = {
            let mut guard = node.write();
            let changed = guard.put_value(name, value.clone());
            if changed {
                guard.mark_modified();
            }
            (changed, guard.key().cloned())
        };
        if let Value::Node(handle) = &value {
            self.adopt(node, name, handle)?;
        }
        if let (true, Some(rel), Some(key)) = (changed, &rel, key) {
            if rel.kind() == RelationKind::Reference && !rel.uses_primary_key() {
                self.manager.evict_key(&Key::synthetic(&key, name));
            }
        }
        if changed {
            self.reorder_in_parent(node, name)?;
        }
        Ok(())
    }

    /// Sets a string property.
    pub fn set_string(&mut self, node: &NodeRef, name: &str, value: impl Into<String>) -> Result<()> {
        self.set_property(node, name, Value::Str(value.into()))
    }

    /// Sets an integer property.
    pub fn set_int(&mut self, node: &NodeRef, name: &str, value: i64) -> Result<()> {
        self.set_property(node, name, Value::Int(value))
    }

    /// Sets a float property.
    pub fn set_float(&mut self, node: &NodeRef, name: &str, value: f64) -> Result<()> {
        self.set_property(node, name, Value::Float(value))
    }

    /// Sets a boolean property.
    pub fn set_bool(&mut self, node: &NodeRef, name: &str, value: bool) -> Result<()> {
        self.set_property(node, name, Value::Bool(value))
    }

    /// Sets a date property, stored with millisecond precision.
    pub fn set_date(&mut self, node: &NodeRef, name: &str, value: OffsetDateTime) -> Result<()> {
        let millis = (value.unix_timestamp_nanos() / 1_000_000) as i64;
        self.set_property(node, name, Value::Date(millis))
    }

    /// Points property `name` at `target`.
    pub fn set_node(&mut self, node: &NodeRef, name: &str, target: &NodeRef) -> Result<()> {
        self.set_property(node, name, Value::Node(NodeHandle::for_node(target)))
    }

    /// Sets an opaque binary property.
    pub fn set_opaque(&mut self, node: &NodeRef, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.set_property(node, name, Value::Opaque(bytes))
    }

    /// Removes property `name`.
    pub fn unset(&mut self, node: &NodeRef, name: &str) -> Result<()> {
        if node.read().value(name).is_none() {
            return Ok(());
        }
        self.check_write_lock(node)?;
        let cleared = {
            let mut guard = node.write();
            let cleared = guard.clear_value(name).is_some();
            if cleared {
                guard.mark_modified();
            }
            cleared
        };
        if cleared {
            self.reorder_in_parent(node, name)?;
        }
        Ok(())
    }

    /// Renames `node`; the name it was reachable under is forgotten.
    pub fn set_name(&mut self, node: &NodeRef, name: &str) -> Result<()> {
        self.check_write_lock(node)?;
        let (old, parent) = {
            let mut guard = node.write();
            let old = guard.set_name_raw(Some(name.to_owned()));
            if old.as_deref() == Some(name) {
                return Ok(());
            }
            guard.set_anonymous(false);
            guard.mark_modified();
            (old, guard.parent().and_then(NodeHandle::key))
        };
        if let (Some(old), Some(parent)) = (old, parent) {
            self.manager.evict_key(&Key::synthetic(&parent, old));
        }
        self.reorder_in_parent(node, NAME_COLUMN)
    }

    /// Keeps the parent's child list ordered after `field` of `node` changed.
    ///
    /// An ordered list re-sorts `node` when its ordering reads `field`, and a
    /// plain list drops the cached views that read it. Parents that are not
    /// loaded are left alone.
    fn reorder_in_parent(&mut self, node: &NodeRef, field: &str) -> Result<()> {
        let (parent, column) = {
            let guard = node.read();
            let Some(parent) = guard.parent().cloned() else {
                return Ok(());
            };
            let mapping = guard.mapping();
            let column = if field == NAME_COLUMN {
                mapping.and_then(|m| m.name_column()).map(str::to_owned)
            } else {
                mapping
                    .and_then(|m| m.relation(field))
                    .and_then(|r| r.column())
                    .map(str::to_owned)
            };
            (parent, column)
        };
        let parent = match parent.direct() {
            Some(direct) => Some(Arc::clone(direct)),
            None => parent.key().and_then(|key| self.manager.lookup(self, &key)),
        };
        let Some(parent) = parent else {
            return Ok(());
        };
        let reads = |candidate: &str| {
            candidate == field || column.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(candidate))
        };

        let (subnodes, stamp) = {
            let mut guard = parent.write();
            (guard.take_subnodes(), guard.subnodes_stamp())
        };
        let Some(mut subnodes) = subnodes else {
            return Ok(());
        };
        let result = match &mut subnodes {
            Subnodes::Plain(list) => {
                list.drop_views_on(reads);
                Ok(())
            }
            Subnodes::Updateable(list) => {
                list.list_mut().drop_views_on(reads);
                Ok(())
            }
            Subnodes::Ordered(list) if list.spec().fields().iter().any(|f| reads(&f.field)) => {
                let spec = list.spec().clone();
                let handle = NodeHandle::for_node(node);
                list.resort(&handle, &mut |h: &NodeHandle| self.sort_row(h, &spec))
                    .map(drop)
            }
            _ => Ok(()),
        };
        parent.write().put_subnodes(subnodes, stamp);
        result
    }

    fn adopt(&mut self, owner: &NodeRef, name: &str, handle: &NodeHandle) -> Result<()> {
        let Some(child) = self.resolve(handle)? else {
            return Ok(());
        };
        if Arc::ptr_eq(&child, owner) {
            return Ok(());
        }
        let owner_persistent = owner.read().state().is_persistent();
        let (transient, has_parent, relational) = {
            let guard = child.read();
            (
                guard.state() == NodeState::Transient,
                guard.parent().is_some(),
                guard.is_relational(),
            )
        };
        if has_parent || relational {
            return Ok(());
        }
        self.check_write_lock(&child)?;
        {
            let mut guard = child.write();
            guard.set_parent(Some(NodeHandle::for_node(owner)));
            if guard.name().is_none() {
                guard.set_name_raw(Some(name.to_owned()));
            }
            guard.set_anonymous(false);
            guard.mark_modified();
        }
        if transient && owner_persistent {
            self.make_persistable(&child)?;
        }
        Ok(())
    }

    /// Promotes a transient node and every transient node it references to
    /// `New`, assigning permanent ids.
    pub fn make_persistable(&mut self, node: &NodeRef) -> Result<()> {
        let mapping = {
            let guard = node.read();
            if guard.state() != NodeState::Transient {
                return Ok(());
            }
            guard.mapping().cloned()
        };
        self.ensure_alive()?;
        if !self.is_active() {
            return Err(StoreError::NoTransaction);
        }
        let manager = Arc::clone(&self.manager);
        let id = match &mapping {
            Some(m) if m.is_relational() => manager.generate_sql_id(self, m)?,
            _ => manager.generate_id(),
        };
        let key = Key::db(mapping.as_ref().and_then(|m| m.storage_name()), id.clone());
        debug!(%key, "node persisted");
        node.write().assign_identity(id, key, NodeState::New);
        self.check_write_lock(node)?;

        let reachable: Vec<NodeRef> = {
            let guard = node.read();
            let children = guard.subnodes().map(Subnodes::handles).unwrap_or_default();
            let referenced = guard
                .properties()
                .filter_map(|p| p.value().as_node().cloned());
            children
                .into_iter()
                .chain(referenced)
                .filter_map(|h| h.transient_node())
                .collect()
        };
        for child in reachable {
            self.make_persistable(&child)?;
        }
        Ok(())
    }

    /// Adds `child` under `parent` at `position` (appends for `None`).
    ///
    /// Grouped collections route the child through the group node for its
    /// grouping value, which is created on first use. Relational children get
    /// the relation's constraint columns set. Returns the node the child was
    /// actually added to.
    pub fn add_node(
        &mut self,
        parent: &NodeRef,
        child: &NodeRef,
        position: Option<usize>,
    ) -> Result<NodeRef> {
        if Arc::ptr_eq(parent, child) {
            return Err(StoreError::Invalid("cannot add a node to itself"));
        }
        let rel = parent
            .read()
            .mapping()
            .and_then(|m| m.subnode_relation().cloned());
        let manager = Arc::clone(&self.manager);

        if let Some(rel) = rel.as_ref().filter(|r| r.group_by().is_some()) {
            self.ensure_alive()?;
            if !self.is_active() {
                return Err(StoreError::NoTransaction);
            }
            self.check_write_lock(parent)?;
            let group = self.group_value(child, rel)?;
            let parent_key = parent
                .read()
                .key()
                .cloned()
                .ok_or(StoreError::Invalid("grouped collections need a persistent parent"))?;
            let group_mapping = rel
                .group_mapping()
                .cloned()
                .ok_or_else(|| StoreError::Schema(format!("{} lacks a group mapping", rel.prop_name())))?;
            let key = Key::synthetic(&parent_key, group.as_str());
            let group_node = manager.virtual_node(self, key, &group, group_mapping, parent);
            self.insert_handle(parent, NodeHandle::for_node(&group_node), None)?;
            return self.add_node(&group_node, child, position);
        }

        self.check_write_lock(parent)?;
        let parent_persistent = parent.read().state().is_persistent();
        if parent_persistent && child.read().state() == NodeState::Transient {
            self.make_persistable(child)?;
        }
        self.check_write_lock(child)?;
        if let Some(rel) = rel.as_ref().filter(|r| r.is_relational()) {
            self.stamp_constraints(parent, child, rel)?;
        }
        {
            let mut guard = child.write();
            let adopt = guard.parent().is_none() || !guard.is_relational();
            if adopt {
                guard.set_parent(Some(NodeHandle::for_node(parent)));
            }
            guard.mark_modified();
        }
        self.insert_handle(parent, NodeHandle::for_node(child), position)?;
        parent.write().mark_modified();
        Ok(Arc::clone(parent))
    }

    fn group_value(&mut self, child: &NodeRef, rel: &Relation) -> Result<String> {
        let column = rel.group_by().unwrap_or_default();
        let value = {
            let guard = child.read();
            local_value(&guard, column)
        };
        value
            .map(|v| v.to_text())
            .ok_or(StoreError::Invalid("child lacks a value for the grouping column"))
    }

    fn stamp_constraints(&mut self, parent: &NodeRef, child: &NodeRef, rel: &Relation) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        let bounds = manager.bind_constraints(self, parent, rel)?;
        let owner = manager.owner_of(self, parent)?;
        let mut guard = child.write();
        let Some(mapping) = guard.mapping().cloned() else {
            return Ok(());
        };
        let same = |col: Option<&str>, other: &str| col.is_some_and(|c| c.eq_ignore_ascii_case(other));
        for bound in bounds {
            let Some(value) = bound.value else { continue };
            if same(mapping.name_column(), &bound.foreign) {
                guard.set_name_raw(Some(value.to_text()));
                continue;
            }
            let Some(prop) = mapping.column_to_property(&bound.foreign).map(str::to_owned) else {
                continue;
            };
            let is_reference = mapping
                .relation(&prop)
                .is_some_and(|r| r.kind() == RelationKind::Reference && r.uses_primary_key());
            let value = if bound.owner_key && is_reference {
                Value::Node(NodeHandle::for_node(&owner))
            } else {
                value
            };
            guard.put_value(&prop, value);
        }
        Ok(())
    }

    /// Detaches `child` from `parent`.
    ///
    /// Relational children have their constraint columns cleared.
    pub fn remove_node(&mut self, parent: &NodeRef, child: &NodeRef) -> Result<()> {
        self.check_write_lock(parent)?;
        let handle = NodeHandle::for_node(child);
        self.ensure_subnodes(parent)?;
        let (removed, parent_key, rel) = {
            let mut guard = parent.write();
            let removed = guard
                .subnodes_mut()
                .as_mut()
                .is_some_and(|s| s.remove(&handle));
            if removed {
                guard.mark_modified();
            }
            (
                removed,
                guard.key().cloned(),
                guard.mapping().and_then(|m| m.subnode_relation().cloned()),
            )
        };

        let relational = rel.as_ref().is_some_and(|r| r.is_relational());
        let clear: Vec<String> = match &rel {
            Some(rel) if relational => {
                let manager = Arc::clone(&self.manager);
                let bounds = manager.bind_constraints(self, parent, rel)?;
                let guard = child.read();
                let mapping = guard.mapping().cloned();
                bounds
                    .iter()
                    .filter_map(|b| mapping.as_ref()?.column_to_property(&b.foreign).map(str::to_owned))
                    .collect()
            }
            _ => Vec::new(),
        };

        if child.read().state() != NodeState::Deleted {
            self.check_write_lock(child)?;
        }
        let name = {
            let mut guard = child.write();
            if guard.parent().is_some_and(|p| p.points_to(parent)) {
                guard.set_parent(None);
            }
            for prop in &clear {
                guard.clear_value(prop);
            }
            if removed || !clear.is_empty() {
                guard.mark_modified();
            }
            guard.name().map(str::to_owned)
        };
        if let (Some(parent_key), Some(name)) = (parent_key, name) {
            self.manager.evict_key(&Key::synthetic(&parent_key, name));
        }
        Ok(())
    }

    /// Deletes `node`.
    ///
    /// The node is detached from its parent and anonymous embedded children
    /// are deleted with it. Relational children are left alone.
    ///
    /// Nodes that refer to `node` through a reference property are not
    /// notified. Their reference dangles and resolves to `None` the next time
    /// [`Transactor::get_node_property`] reads it.
    pub fn delete_node(&mut self, node: &NodeRef) -> Result<()> {
        let (state, parent, relational) = {
            let guard = node.read();
            (guard.state(), guard.parent().cloned(), guard.is_relational())
        };
        if state == NodeState::Deleted {
            return Ok(());
        }
        self.check_write_lock(node)?;
        if let Some(parent) = parent {
            if let Some(parent) = self.resolve(&parent)? {
                self.remove_node(&parent, node)?;
            }
        }
        if !relational {
            let children = node.read().subnodes().map(Subnodes::handles).unwrap_or_default();
            for handle in children {
                let Some(child) = self.resolve(&handle)? else { continue };
                let cascade = {
                    let guard = child.read();
                    guard.is_anonymous()
                        && !guard.is_relational()
                        && guard.parent().is_some_and(|p| p.points_to(node))
                };
                if cascade {
                    self.delete_node(&child)?;
                }
            }
        }
        let mut guard = node.write();
        if guard.state() == NodeState::Transient {
            return Ok(());
        }
        guard.set_state(NodeState::Deleted);
        debug!(key = ?guard.key(), "node deleted");
        Ok(())
    }

    /// Parent of `node`: the stored parent link, else the first parent path
    /// of its mapping that resolves.
    pub fn parent_of(&mut self, node: &NodeRef) -> Result<Option<NodeRef>> {
        let (parent, mapping) = {
            let guard = node.read();
            (guard.parent().cloned(), guard.mapping().cloned())
        };
        if let Some(parent) = parent {
            return self.resolve(&parent);
        }
        let Some(mapping) = mapping else {
            return Ok(None);
        };
        for info in mapping.parents() {
            match info {
                ParentInfo::Root => return self.root().map(Some),
                ParentInfo::Property { name, virtual_name } => {
                    let Some(owner) = self.get_node_property(node, name)? else {
                        continue;
                    };
                    match virtual_name {
                        None => return Ok(Some(owner)),
                        Some(virtual_name) => {
                            if let Some(parent) = self.get_node_property(&owner, virtual_name)? {
                                return Ok(Some(parent));
                            }
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Child of `parent` reachable under `name`.
    ///
    /// Relational collections are queried by their access column (or group
    /// value); otherwise the materialized children are searched by name.
    pub fn get_child(&mut self, parent: &NodeRef, name: &str) -> Result<Option<NodeRef>> {
        let (rel, keyed) = {
            let guard = parent.read();
            (
                guard.mapping().and_then(|m| m.subnode_relation().cloned()),
                guard.key().is_some(),
            )
        };
        if let Some(rel) = rel.filter(|r| r.is_relational() && keyed) {
            let manager = Arc::clone(&self.manager);
            if let Some(child) = manager.get_node_by_relation(self, parent, name, &rel)? {
                return Ok(Some(child));
            }
        }
        for handle in self.subnodes(parent)? {
            let Some(child) = self.resolve(&handle)? else { continue };
            if child.read().name() == Some(name) {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// All children of `node`, in list order.
    pub fn subnodes(&mut self, node: &NodeRef) -> Result<Vec<NodeHandle>> {
        self.ensure_subnodes(node)?;
        let segmented = matches!(node.read().subnodes(), Some(Subnodes::Segmented(_)));
        if !segmented {
            return Ok(node.read().subnodes().map(Subnodes::handles).unwrap_or_default());
        }
        let count = self.count_subnodes(node)?;
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            if let Some(handle) = self.subnode_handle(node, index)? {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Number of children of `node`.
    ///
    /// Segmented collections answer from a cached backend count.
    pub fn count_subnodes(&mut self, node: &NodeRef) -> Result<usize> {
        self.ensure_subnodes(node)?;
        let (subnodes, stamp, rel) = {
            let mut guard = node.write();
            let rel = guard.mapping().and_then(|m| m.subnode_relation().cloned());
            (guard.take_subnodes(), guard.subnodes_stamp(), rel)
        };
        let Some(mut subnodes) = subnodes else {
            return Ok(0);
        };
        let result = match (&mut subnodes, rel) {
            (Subnodes::Segmented(list), Some(rel)) => {
                let manager = Arc::clone(&self.manager);
                self.target_stamp(&rel).and_then(|current| {
                    list.size(current.max(stamp), || manager.count_nodes(self, node, &rel))
                })
            }
            (other, _) => Ok(other.loaded_len()),
        };
        node.write().put_subnodes(subnodes, stamp);
        result
    }

    /// Child at `index`.
    pub fn subnode_at(&mut self, node: &NodeRef, index: usize) -> Result<Option<NodeRef>> {
        self.ensure_subnodes(node)?;
        match self.subnode_handle(node, index)? {
            Some(handle) => self.resolve(&handle),
            None => Ok(None),
        }
    }

    fn subnode_handle(&mut self, node: &NodeRef, index: usize) -> Result<Option<NodeHandle>> {
        let (subnodes, stamp, rel) = {
            let mut guard = node.write();
            let rel = guard.mapping().and_then(|m| m.subnode_relation().cloned());
            (guard.take_subnodes(), guard.subnodes_stamp(), rel)
        };
        let Some(mut subnodes) = subnodes else {
            return Ok(None);
        };
        let result = match (&mut subnodes, rel) {
            (Subnodes::Segmented(list), Some(rel)) => {
                let manager = Arc::clone(&self.manager);
                self.target_stamp(&rel).and_then(|current| {
                    let current = current.max(stamp);
                    list.size(current, || manager.count_nodes(self, node, &rel))?;
                    list.get(current, index, |offset, limit| {
                        manager.query_ids(self, node, &rel, Some((offset, limit)))
                    })
                })
            }
            (other, _) => Ok(other.handles().get(index).cloned()),
        };
        node.write().put_subnodes(subnodes, stamp);
        result
    }

    /// Children of `node` sorted by `expr` (e.g. `"title asc, created desc"`).
    ///
    /// The sorted view of a plain list is cached per expression and kept in
    /// sync with later additions.
    pub fn ordered_subnodes(&mut self, node: &NodeRef, expr: &str) -> Result<Vec<NodeHandle>> {
        let spec = OrderSpec::parse(expr)?;
        let handles = self.subnodes(node)?;
        let (subnodes, stamp) = {
            let mut guard = node.write();
            (guard.take_subnodes(), guard.subnodes_stamp())
        };
        let mut lookup = |h: &NodeHandle| self.sort_row(h, &spec);
        match subnodes {
            Some(Subnodes::Plain(mut list)) => {
                let sorted = list.ordered_view(&spec, &mut lookup);
                node.write().put_subnodes(Subnodes::Plain(list), stamp);
                sorted
            }
            other => {
                let mut view = OrderedSubnodeList::new(spec.clone());
                let sorted = view
                    .add_all(handles, false, &mut lookup)
                    .map(|()| view.handles().to_vec());
                if let Some(other) = other {
                    node.write().put_subnodes(other, stamp);
                }
                sorted
            }
        }
    }

    fn sort_row(&mut self, handle: &NodeHandle, spec: &OrderSpec) -> Result<SortRow> {
        let Some(node) = self.resolve(handle)? else {
            return Ok(vec![None; spec.fields().len()]);
        };
        let guard = node.read();
        Ok(spec
            .fields()
            .iter()
            .map(|f| local_value(&guard, &f.field))
            .collect())
    }

    /// Evicts `node` so the next access re-fetches it.
    pub fn invalidate(&mut self, node: &NodeRef) {
        let key = node.read().key().cloned();
        if let Some(key) = key {
            self.clean.remove(&key);
            self.drop_node(&key);
        }
        self.manager.evict_node(node);
    }

    fn target_stamp(&self, rel: &Relation) -> Result<u64> {
        let target = self.manager.target_mapping(rel)?;
        Ok(target
            .storage_name()
            .map_or(0, |storage| self.manager.data_stamp(storage)))
    }

    /// Materializes the child list of `node`, refetching relational lists
    /// whose data changed since they were loaded.
    fn ensure_subnodes(&mut self, node: &NodeRef) -> Result<()> {
        let (rel, keyed, loaded, stamp) = {
            let guard = node.read();
            (
                guard.mapping().and_then(|m| m.subnode_relation().cloned()),
                guard.key().is_some() && guard.state() != NodeState::New,
                guard.subnodes().is_some(),
                guard.subnodes_stamp(),
            )
        };
        let Some(rel) = rel.filter(|r| r.is_relational() && keyed) else {
            if !loaded {
                node.write().put_subnodes(Subnodes::default(), 0);
            }
            return Ok(());
        };
        let current = self.target_stamp(&rel)?;
        if loaded && stamp >= current {
            return Ok(());
        }
        let manager = Arc::clone(&self.manager);

        if rel.is_segmented() {
            if !loaded {
                let list = SegmentedSubnodeList::new(manager.config().segment_size);
                node.write().put_subnodes(Subnodes::Segmented(list), current);
            }
            return Ok(());
        }

        if !rel.update_criteria().is_empty() {
            let previous = node.write().take_subnodes();
            let mut list = match previous {
                Some(Subnodes::Updateable(list)) if list.criteria() == rel.update_criteria() => list,
                _ => UpdateableSubnodeList::new(rel.update_criteria().to_vec()),
            };
            let rows = manager.get_updated_node_ids(self, node, &rel, list.watermarks());
            let rows = match rows {
                Ok(rows) => rows,
                Err(err) => {
                    node.write().put_subnodes(Subnodes::Updateable(list), stamp);
                    return Err(err);
                }
            };
            let added = list.apply_update(rows);
            for handle in self.own_new_children(node) {
                if !list.list().contains(&handle) {
                    list.list_mut().add(handle, None);
                }
            }
            debug!(added, "incremental child refresh");
            node.write().put_subnodes(Subnodes::Updateable(list), current);
            return Ok(());
        }

        let handles = if rel.aggressive_loading() || rel.aggressive_caching() {
            manager.get_nodes(self, node, &rel)?
        } else {
            manager.get_node_ids(self, node, &rel)?
        };
        let spec = rel
            .order()
            .filter(|_| rel.group_by().is_none())
            .and_then(|order| OrderSpec::parse(order).ok());
        let mut subnodes = match spec {
            Some(spec) => Subnodes::Ordered(OrderedSubnodeList::from_sorted(spec, handles)),
            None => Subnodes::Plain(SubnodeList::from_handles(handles)),
        };
        for handle in self.own_new_children(node) {
            if subnodes.contains(&handle) {
                continue;
            }
            match &mut subnodes {
                Subnodes::Ordered(list) => {
                    let spec = list.spec().clone();
                    list.sort_in(handle, &mut |h: &NodeHandle| self.sort_row(h, &spec))?;
                }
                Subnodes::Plain(list) => {
                    list.add(handle, None);
                }
                _ => {}
            }
        }
        node.write().put_subnodes(subnodes, current);
        Ok(())
    }

    /// Children this transaction created under `node` that the backend does
    /// not know about yet.
    fn own_new_children(&self, node: &NodeRef) -> Vec<NodeHandle> {
        self.shared
            .state
            .lock()
            .dirty
            .ordered()
            .into_iter()
            .filter(|(_, child)| {
                let guard = child.read();
                guard.state() == NodeState::New && guard.parent().is_some_and(|p| p.points_to(node))
            })
            .map(|(key, _)| NodeHandle::from_key(key))
            .collect()
    }

    /// Adds `handle` to the child list of `parent`, keeping its order.
    fn insert_handle(
        &mut self,
        parent: &NodeRef,
        handle: NodeHandle,
        position: Option<usize>,
    ) -> Result<()> {
        self.ensure_subnodes(parent)?;
        let (subnodes, stamp) = {
            let mut guard = parent.write();
            (guard.take_subnodes().unwrap_or_default(), guard.subnodes_stamp())
        };
        let mut subnodes = subnodes;
        let result = if subnodes.contains(&handle) {
            Ok(())
        } else {
            match &mut subnodes {
                Subnodes::Plain(list) => {
                    list.add(handle, position);
                    Ok(())
                }
                Subnodes::Ordered(list) => {
                    let spec = list.spec().clone();
                    list.sort_in(handle, &mut |h: &NodeHandle| self.sort_row(h, &spec))
                        .map(drop)
                }
                Subnodes::Segmented(list) => {
                    list.add(handle);
                    Ok(())
                }
                Subnodes::Updateable(list) => {
                    list.list_mut().add(handle, position);
                    Ok(())
                }
            }
        };
        parent.write().put_subnodes(subnodes, stamp);
        result
    }
}

/// Rejects values that cannot be stored through `rel`.
fn check_value(rel: &Relation, value: &Value) -> Result<()> {
    let mismatch = |expected| StoreError::TypeMismatch {
        property: rel.prop_name().to_owned(),
        expected,
    };
    if rel.is_virtual() || rel.kind() == RelationKind::Collection {
        return Err(mismatch("nothing; collections are derived from their children"));
    }
    match (rel.kind(), value.kind()) {
        (RelationKind::Reference, ValueKind::Node) => Ok(()),
        (RelationKind::Reference, _) => Err(mismatch("a node reference")),
        (RelationKind::Primitive, ValueKind::Node) => Err(mismatch("a primitive value")),
        _ => Ok(()),
    }
}
