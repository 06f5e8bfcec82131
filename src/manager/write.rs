//! Commit-time writes of single nodes.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{trace, warn};

use super::fetch::{id_column_of, local_value, table_of};
use super::sql::{self, Statement};
use super::NodeManager;
use crate::error::{Result, StoreError};
use crate::mapping::{DbMapping, Relation, RelationKind};
use crate::node::NodeRef;
use crate::resolve::{value_to_sql, ColumnTypes};
use crate::store::sql::SqlValue;
use crate::store::NodeRecord;
use crate::transactor::Transactor;
use crate::value::Value;

/// Columns and values collected for one statement.
#[derive(Default)]
struct Cells {
    columns: Vec<String>,
    params: Vec<SqlValue>,
    seen: FxHashSet<String>,
}

impl Cells {
    fn push(&mut self, column: &str, value: SqlValue) {
        if self.seen.insert(column.to_ascii_uppercase()) {
            self.columns.push(column.to_owned());
            self.params.push(value);
        }
    }

    fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl NodeManager {
    /// Writes a new node: a record in the embedded store or a row.
    pub fn insert_node(&self, txn: &mut Transactor, node: &NodeRef) -> Result<()> {
        let Some(mapping) = relational_mapping(node) else {
            return self.write_record(txn, node);
        };
        let types = self.column_types(txn, &mapping)?;
        let table = table_of(&mapping)?;
        let id_column = id_column_of(&mapping)?;

        let (id, name, prototype, values) = {
            let guard = node.read();
            let values: Vec<(Arc<Relation>, Value)> = mapping
                .relations()
                .filter(|rel| rel.is_persisted_column())
                .filter_map(|rel| guard.value(rel.prop_name()).map(|v| (Arc::clone(rel), v.clone())))
                .collect();
            (
                guard.id().to_owned(),
                guard.name().map(str::to_owned),
                guard.prototype().map(str::to_owned),
                values,
            )
        };

        let mut cells = Cells::default();
        cells.push(id_column, value_to_sql(&Value::from(id), column_type(&types, id_column)));
        if let (Some(column), Some(name)) = (mapping.name_column(), name) {
            cells.push(column, value_to_sql(&Value::from(name), column_type(&types, column)));
        }
        if let Some(column) = mapping.prototype_column() {
            let proto = prototype.unwrap_or_else(|| mapping.type_name().to_owned());
            cells.push(column, SqlValue::Text(proto));
        }
        for (rel, value) in values {
            if let Some(column) = rel.column() {
                let param = self.column_value(txn, &rel, &value, &types)?;
                cells.push(column, param);
            }
        }
        let stmt = sql::insert(table, &cells.columns, cells.params);
        self.execute(txn, &mapping, stmt)?;
        Ok(())
    }

    /// Writes the changed cells of a modified node.
    ///
    /// Returns `false` when nothing needed writing.
    pub fn update_node(&self, txn: &mut Transactor, node: &NodeRef) -> Result<bool> {
        let Some(mapping) = relational_mapping(node) else {
            self.write_record(txn, node)?;
            return Ok(true);
        };
        let types = self.column_types(txn, &mapping)?;
        let table = table_of(&mapping)?;
        let id_column = id_column_of(&mapping)?;

        let (id, name, dirty, cleared) = {
            let guard = node.read();
            let name = match (guard.name_dirty(), mapping.name_column()) {
                (true, Some(_)) => Some(guard.name().map(str::to_owned)),
                _ => None,
            };
            let dirty: Vec<(Arc<Relation>, Value)> = guard
                .properties()
                .filter(|p| p.is_dirty())
                .filter_map(|p| {
                    let rel = mapping.relation(p.name())?;
                    rel.is_persisted_column().then(|| (Arc::clone(rel), p.value().clone()))
                })
                .collect();
            let cleared: Vec<String> = guard
                .cleared()
                .iter()
                .filter_map(|prop| mapping.relation(prop))
                .filter(|rel| rel.is_persisted_column())
                .filter_map(|rel| rel.column().map(str::to_owned))
                .collect();
            (guard.id().to_owned(), name, dirty, cleared)
        };

        let mut cells = Cells::default();
        if let (Some(column), Some(name)) = (mapping.name_column(), name) {
            let value = name.map_or(SqlValue::Null, |n| {
                value_to_sql(&Value::from(n), column_type(&types, column))
            });
            cells.push(column, value);
        }
        for (rel, value) in dirty {
            if let Some(column) = rel.column() {
                let param = self.column_value(txn, &rel, &value, &types)?;
                cells.push(column, param);
            }
        }
        for column in cleared {
            cells.push(&column, SqlValue::Null);
        }
        if cells.is_empty() {
            trace!(id, "no changed columns");
            return Ok(false);
        }
        let key = value_to_sql(&Value::from(id.as_str()), column_type(&types, id_column));
        let stmt = sql::update(table, &cells.columns, cells.params, id_column, key);
        if self.execute(txn, &mapping, stmt)? == 0 {
            warn!(id, table, "update matched no row");
        }
        Ok(true)
    }

    /// Removes a node's record or row.
    pub fn delete_node(&self, txn: &mut Transactor, node: &NodeRef) -> Result<()> {
        let Some(mapping) = relational_mapping(node) else {
            let id = node.read().id().to_owned();
            txn.store_txn()?.delete(id);
            return Ok(());
        };
        let types = self.column_types(txn, &mapping)?;
        let table = table_of(&mapping)?;
        let id_column = id_column_of(&mapping)?;
        let id = node.read().id().to_owned();
        let stmt = sql::delete(
            table,
            id_column,
            value_to_sql(&Value::from(id), column_type(&types, id_column)),
        );
        self.execute(txn, &mapping, stmt)?;
        Ok(())
    }

    fn write_record(&self, txn: &mut Transactor, node: &NodeRef) -> Result<()> {
        let (id, bytes) = {
            let guard = node.read();
            (guard.id().to_owned(), NodeRecord::from_node(&guard)?.to_bytes()?)
        };
        txn.store_txn()?.put(id, bytes);
        Ok(())
    }

    fn execute(&self, txn: &mut Transactor, mapping: &DbMapping, stmt: Statement) -> Result<usize> {
        let source = self.source_name(mapping)?;
        trace!(sql = %stmt.sql, params = stmt.params.len(), "execute");
        txn.connection(&source)?.execute(&stmt.sql, &stmt.params)
    }

    /// Column value of a property cell.
    ///
    /// References not using the target's primary key store the target's
    /// value of the foreign column instead of its id.
    fn column_value(
        &self,
        txn: &mut Transactor,
        rel: &Relation,
        value: &Value,
        types: &ColumnTypes,
    ) -> Result<SqlValue> {
        let ty = rel.column().and_then(|c| column_type(types, c));
        let Value::Node(handle) = value else {
            return Ok(value_to_sql(value, ty));
        };
        if rel.kind() != RelationKind::Reference || rel.uses_primary_key() {
            return Ok(value_to_sql(value, ty));
        }
        let foreign = rel
            .constraints()
            .first()
            .map(|c| c.foreign.clone())
            .ok_or_else(|| StoreError::Schema(format!("{} has no foreign column", rel.prop_name())))?;
        let target = match handle.direct() {
            Some(node) => Some(Arc::clone(node)),
            None => match handle.key() {
                Some(key) => self.get_node_by_key(txn, &key)?,
                None => None,
            },
        };
        let resolved = target.and_then(|node| local_value(&node.read(), &foreign));
        Ok(resolved.map_or(SqlValue::Null, |v| value_to_sql(&v, ty)))
    }
}

fn relational_mapping(node: &NodeRef) -> Option<Arc<DbMapping>> {
    node.read()
        .mapping()
        .filter(|m| m.is_relational())
        .cloned()
}

fn column_type(types: &ColumnTypes, column: &str) -> Option<crate::store::sql::ColumnType> {
    types.get(&column.to_ascii_uppercase()).copied()
}
