//! Relational reads: constraint binding, child id lists and counts.

use std::sync::Arc;

use tracing::trace;

use super::sql::{self, Filter, Statement};
use super::NodeManager;
use crate::error::{Result, StoreError};
use crate::handle::NodeHandle;
use crate::key::Key;
use crate::mapping::{DbMapping, Relation, ID_COLUMN, NAME_COLUMN, PROTOTYPE_COLUMN};
use crate::node::{Node, NodeRef, NodeState};
use crate::resolve::{resolve_row, row_mapping, sql_to_value, value_to_sql, ColumnTypes};
use crate::store::sql::{Row, SqlValue};
use crate::subnodes::Watermark;
use crate::transactor::Transactor;
use crate::value::Value;

/// A join condition with the owner's side already evaluated.
#[derive(Clone, Debug)]
pub(crate) struct Bound {
    /// Column of the child table.
    pub(crate) foreign: String,
    /// Value the child column must hold, `None` for NULL.
    pub(crate) value: Option<Value>,
    /// Whether the value is the owner's primary key.
    pub(crate) owner_key: bool,
}

/// Value of a constraint's local side on `node`.
///
/// `$id`, `$name` and `$prototype` address the node's identity; any other
/// name is a column of the node's table or, for embedded nodes, a property.
pub(crate) fn local_value(node: &Node, local: &str) -> Option<Value> {
    let same = |col: Option<&str>| col.is_some_and(|c| c.eq_ignore_ascii_case(local));
    let mapping = node.mapping();
    if local == ID_COLUMN || same(mapping.and_then(|m| m.id_column())) {
        return Some(Value::from(node.id()));
    }
    if local == NAME_COLUMN || same(mapping.and_then(|m| m.name_column())) {
        return node.name().map(Value::from);
    }
    if local == PROTOTYPE_COLUMN || same(mapping.and_then(|m| m.prototype_column())) {
        return node.prototype().map(Value::from);
    }
    match mapping.and_then(|m| m.column_to_property(local)) {
        Some(prop) => node.value(prop).cloned(),
        None => node.value(local).cloned(),
    }
}

fn is_owner_key(node: &Node, local: &str) -> bool {
    local == ID_COLUMN
        || node
            .mapping()
            .and_then(|m| m.id_column())
            .is_some_and(|c| c.eq_ignore_ascii_case(local))
}

fn column_type(types: &ColumnTypes, column: &str) -> Option<crate::store::sql::ColumnType> {
    types.get(&column.to_ascii_uppercase()).copied()
}

impl NodeManager {
    /// Mapping of the objects `rel` points at.
    pub(crate) fn target_mapping(&self, rel: &Relation) -> Result<Arc<DbMapping>> {
        let target = rel
            .target()
            .ok_or_else(|| StoreError::Schema(format!("{} has no target type", rel.prop_name())))?;
        self.mapping(target)
            .ok_or_else(|| StoreError::Schema(format!("unknown type {target}")))
    }

    /// The persistent node whose columns bind the constraints of `node`.
    ///
    /// Virtual and group nodes delegate to the node their key descends from.
    pub(crate) fn owner_of(&self, txn: &mut Transactor, node: &NodeRef) -> Result<NodeRef> {
        let key = {
            let guard = node.read();
            if guard.state() != NodeState::Virtual {
                return Ok(Arc::clone(node));
            }
            guard.key().cloned()
        };
        let mut key = key.ok_or(StoreError::Invalid("virtual node without key"))?;
        while let Some(parent) = key.parent() {
            key = parent.clone();
        }
        self.get_node_by_key(txn, &key)?
            .ok_or(StoreError::InvalidNode(key))
    }

    /// Evaluates the constraints of `rel` against the owner of `home`.
    ///
    /// A group node additionally binds the grouping column to its name.
    pub(crate) fn bind_constraints(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        rel: &Relation,
    ) -> Result<Vec<Bound>> {
        let owner = self.owner_of(txn, home)?;
        let mut bounds: Vec<Bound> = {
            let guard = owner.read();
            rel.constraints()
                .iter()
                .map(|c| Bound {
                    foreign: c.foreign.clone(),
                    value: local_value(&guard, &c.local),
                    owner_key: is_owner_key(&guard, &c.local),
                })
                .collect()
        };
        if let Some(column) = rel.grouped_on() {
            let group = home.read().name().map(Value::from);
            bounds.push(Bound {
                foreign: column.to_owned(),
                value: group,
                owner_key: false,
            });
        }
        Ok(bounds)
    }

    /// Conditions selecting the children of `home` through `rel`.
    pub(crate) fn child_filter(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        rel: &Relation,
        target: &DbMapping,
        types: &ColumnTypes,
    ) -> Result<Filter> {
        let mut filter = Filter::new();
        for bound in self.bind_constraints(txn, home, rel)? {
            let value = bound.value.as_ref().map_or(SqlValue::Null, |v| {
                value_to_sql(v, column_type(types, &bound.foreign))
            });
            filter.eq(&bound.foreign, value);
        }
        if let Some(column) = target.prototype_column() {
            if target.storage_name() != Some(target.type_name()) {
                filter.eq(column, SqlValue::Text(target.type_name().to_owned()));
            }
        }
        if let Some(fragment) = rel.filter() {
            filter.raw(fragment);
        }
        if let Some(fragment) = home.read().subnode_filter() {
            filter.raw(fragment);
        }
        Ok(filter)
    }

    fn run_query(
        &self,
        txn: &mut Transactor,
        mapping: &DbMapping,
        stmt: Statement,
    ) -> Result<Vec<Row>> {
        let source = self.source_name(mapping)?;
        trace!(sql = %stmt.sql, params = stmt.params.len(), "query");
        txn.connection(&source)?.query(&stmt.sql, &stmt.params)
    }

    /// Builds a clean node from a row of `mapping` or one of its subtypes.
    pub(crate) fn node_from_row(
        &self,
        mapping: &Arc<DbMapping>,
        row: &Row,
        types: &ColumnTypes,
    ) -> Result<(Key, NodeRef)> {
        let registry = self.registry();
        let mapping = row_mapping(&registry, mapping, row);
        let resolved = resolve_row(&registry, &mapping, row, types)?;
        let key = Key::db(mapping.storage_name(), resolved.id.clone());
        self.metrics.node_loaded();
        Ok((key.clone(), resolved.into_node(key, Some(mapping))))
    }

    /// First row of `mapping` matching `filter`, as a fresh node.
    pub(crate) fn fetch_first(
        &self,
        txn: &mut Transactor,
        mapping: &Arc<DbMapping>,
        filter: Filter,
        types: &ColumnTypes,
    ) -> Result<Option<(Key, NodeRef)>> {
        let table = table_of(mapping)?;
        let stmt = sql::select("*", table, filter, None, Some((0, 1)));
        let rows = self.run_query(txn, mapping, stmt)?;
        rows.first()
            .map(|row| self.node_from_row(mapping, row, types))
            .transpose()
    }

    /// Loads one row by primary key.
    pub(crate) fn load_row(
        &self,
        txn: &mut Transactor,
        mapping: &Arc<DbMapping>,
        id: &str,
    ) -> Result<Option<(Key, NodeRef)>> {
        let types = self.column_types(txn, mapping)?;
        let id_column = id_column_of(mapping)?;
        let mut filter = Filter::new();
        filter.eq(id_column, value_to_sql(&Value::from(id), column_type(&types, id_column)));
        self.fetch_first(txn, mapping, filter, &types)
    }

    /// Child handles of `home` through `rel`, in relation order.
    ///
    /// Group-by relations yield one synthetic handle per distinct group
    /// value. For embedded homes the stored child list is returned.
    pub fn get_node_ids(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        rel: &Relation,
    ) -> Result<Vec<NodeHandle>> {
        if !rel.is_relational() {
            return Ok(home
                .read()
                .subnodes()
                .map(|s| s.handles())
                .unwrap_or_default());
        }
        self.query_ids(txn, home, rel, None)
    }

    /// Like [`NodeManager::get_node_ids`] restricted to `(offset, limit)`.
    pub(crate) fn query_ids(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        rel: &Relation,
        range: Option<(usize, usize)>,
    ) -> Result<Vec<NodeHandle>> {
        let home_key = home_key(home)?;
        let target = self.target_mapping(rel)?;
        let table = table_of(&target)?;
        let types = self.column_types(txn, &target)?;
        let filter = self.child_filter(txn, home, rel, &target, &types)?;
        let range = range.or(rel.max_size().map(|max| (0, max)));

        if let Some(group) = rel.group_by() {
            let order = rel.group_order.as_deref().unwrap_or(group);
            let stmt = sql::select(&format!("DISTINCT {group}"), table, filter, Some(order), range);
            let rows = self.run_query(txn, &target, stmt)?;
            return Ok(rows
                .iter()
                .filter_map(|row| row.value(0).and_then(SqlValue::to_text))
                .map(|name| NodeHandle::from_key(Key::synthetic(&home_key, name)))
                .collect());
        }

        let id_column = id_column_of(&target)?;
        let stmt = sql::select(id_column, table, filter, rel.order(), range);
        let rows = self.run_query(txn, &target, stmt)?;
        Ok(rows
            .iter()
            .filter_map(|row| row.value(0).and_then(SqlValue::to_text))
            .map(|id| NodeHandle::from_key(Key::db(target.storage_name(), id)))
            .collect())
    }

    /// Fetches the children of `home` with all their columns at once,
    /// caching every node it builds.
    pub fn get_nodes(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        rel: &Relation,
    ) -> Result<Vec<NodeHandle>> {
        if !rel.is_relational() || rel.group_by().is_some() {
            return self.get_node_ids(txn, home, rel);
        }
        let target = self.target_mapping(rel)?;
        let table = table_of(&target)?;
        let types = self.column_types(txn, &target)?;
        let filter = self.child_filter(txn, home, rel, &target, &types)?;
        let range = rel.max_size().map(|max| (0, max));
        let stmt = sql::select("*", table, filter, rel.order(), range);
        let rows = self.run_query(txn, &target, stmt)?;

        let mut handles = Vec::with_capacity(rows.len());
        for row in &rows {
            let (key, node) = self.node_from_row(&target, row, &types)?;
            if txn.visited(&key).is_none() {
                self.cache.put_if_absent_or_invalid(key.clone(), node);
            }
            handles.push(NodeHandle::from_key(key));
        }
        Ok(handles)
    }

    /// Number of children of `home` through `rel`.
    pub fn count_nodes(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        rel: &Relation,
    ) -> Result<usize> {
        if !rel.is_relational() {
            return Ok(home.read().subnodes().map_or(0, |s| s.loaded_len()));
        }
        let target = self.target_mapping(rel)?;
        let table = table_of(&target)?;
        let types = self.column_types(txn, &target)?;
        let filter = self.child_filter(txn, home, rel, &target, &types)?;
        let what = match rel.group_by() {
            Some(group) => format!("COUNT(DISTINCT {group})"),
            None => "COUNT(*)".to_owned(),
        };
        let stmt = sql::select(&what, table, filter, None, None);
        let rows = self.run_query(txn, &target, stmt)?;
        let count = rows
            .first()
            .and_then(|row| row.value(0))
            .and_then(SqlValue::to_text)
            .and_then(|text| text.parse::<usize>().ok())
            .unwrap_or(0);
        Ok(rel.max_size().map_or(count, |max| count.min(max)))
    }

    pub(super) fn count_group_members(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        rel: &Relation,
        group: &str,
    ) -> Result<usize> {
        let target = self.target_mapping(rel)?;
        let table = table_of(&target)?;
        let column = rel
            .group_by()
            .ok_or(StoreError::Invalid("relation is not grouped"))?;
        let types = self.column_types(txn, &target)?;
        let mut filter = self.child_filter(txn, home, rel, &target, &types)?;
        filter.eq(column, value_to_sql(&Value::from(group), column_type(&types, column)));
        let stmt = sql::select("COUNT(*)", table, filter, None, None);
        let rows = self.run_query(txn, &target, stmt)?;
        Ok(rows
            .first()
            .and_then(|row| row.value(0))
            .and_then(SqlValue::to_text)
            .and_then(|text| text.parse().ok())
            .unwrap_or(0))
    }

    /// Names under which the children of `home` are reachable: the accessor
    /// column (or primary key) of each child, or the group values.
    pub fn get_property_names(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        rel: &Relation,
    ) -> Result<Vec<String>> {
        if !rel.is_relational() {
            let handles = home.read().subnodes().map(|s| s.handles()).unwrap_or_default();
            let mut names = Vec::with_capacity(handles.len());
            for handle in handles {
                let Some(key) = handle.key() else { continue };
                if let Some(child) = self.get_node_by_key(txn, &key)? {
                    names.push(child.read().display_name().to_owned());
                }
            }
            return Ok(names);
        }
        let target = self.target_mapping(rel)?;
        let table = table_of(&target)?;
        let types = self.column_types(txn, &target)?;
        let filter = self.child_filter(txn, home, rel, &target, &types)?;
        let (what, order) = match rel.group_by() {
            Some(group) => (format!("DISTINCT {group}"), rel.group_order.as_deref().or(Some(group))),
            None => (
                rel.accessor().unwrap_or(id_column_of(&target)?).to_owned(),
                rel.order(),
            ),
        };
        let stmt = sql::select(&what, table, filter, order, None);
        let rows = self.run_query(txn, &target, stmt)?;
        Ok(rows
            .iter()
            .filter_map(|row| row.value(0).and_then(SqlValue::to_text))
            .collect())
    }

    /// Children of `home` whose update criteria lie outside the watermarks,
    /// with their criteria values in column order.
    pub fn get_updated_node_ids(
        &self,
        txn: &mut Transactor,
        home: &NodeRef,
        rel: &Relation,
        marks: &[Watermark],
    ) -> Result<Vec<(NodeHandle, Vec<Option<Value>>)>> {
        let criteria = rel.update_criteria();
        if criteria.is_empty() {
            return Err(StoreError::Schema(format!(
                "{} has no update criteria",
                rel.prop_name()
            )));
        }
        let target = self.target_mapping(rel)?;
        let table = table_of(&target)?;
        let id_column = id_column_of(&target)?;
        let types = self.column_types(txn, &target)?;
        let mut filter = self.child_filter(txn, home, rel, &target, &types)?;
        let bounds = criteria
            .iter()
            .zip(marks)
            .map(|(column, mark)| {
                let to_sql = |v: &Value| value_to_sql(v, column_type(&types, column));
                (
                    column.clone(),
                    mark.lowest.as_ref().map(to_sql),
                    mark.highest.as_ref().map(to_sql),
                )
            })
            .collect();
        filter.outside(bounds);

        let what = std::iter::once(id_column.to_owned())
            .chain(criteria.iter().cloned())
            .collect::<Vec<_>>()
            .join(", ");
        let stmt = sql::select(&what, table, filter, Some(&criteria[0]), None);
        let rows = self.run_query(txn, &target, stmt)?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let id = row.value(0).and_then(SqlValue::to_text)?;
                let values = criteria
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        row.value(i + 1)
                            .filter(|v| !v.is_null())
                            .map(|v| sql_to_value(v, column_type(&types, column)))
                    })
                    .collect();
                Some((NodeHandle::from_key(Key::db(target.storage_name(), id)), values))
            })
            .collect())
    }
}

fn home_key(home: &NodeRef) -> Result<Key> {
    home.read()
        .key()
        .cloned()
        .ok_or(StoreError::Invalid("children of a transient node are not stored"))
}

pub(super) fn table_of(mapping: &DbMapping) -> Result<&str> {
    mapping
        .table()
        .ok_or_else(|| StoreError::Schema(format!("{} has no table", mapping.type_name())))
}

pub(super) fn id_column_of(mapping: &DbMapping) -> Result<&str> {
    mapping
        .id_column()
        .ok_or_else(|| StoreError::Schema(format!("{} has no id column", mapping.type_name())))
}
