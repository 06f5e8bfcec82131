//! Conversion of backend rows and records into node contents.
//!
//! Everything here is a pure function of the schema and the stored data;
//! the manager calls it once per load and never synthesizes properties
//! behind a getter.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{Result, StoreError};
use crate::handle::NodeHandle;
use crate::key::Key;
use crate::mapping::{DbMapping, MappingRegistry, RelationKind};
use crate::node::{Node, NodeRef};
use crate::store::sql::{ColumnInfo, ColumnType, Row, SqlValue};
use crate::store::NodeRecord;
use crate::subnodes::{SubnodeList, Subnodes};
use crate::value::{Property, Value};

/// Column types of one table keyed by upper-cased column name.
pub type ColumnTypes = FxHashMap<String, ColumnType>;

/// Indexes introspected columns by name.
pub fn column_types(columns: &[ColumnInfo]) -> ColumnTypes {
    columns
        .iter()
        .map(|c| (c.name.to_ascii_uppercase(), c.column_type))
        .collect()
}

/// Node contents decoded from a row or record.
#[derive(Debug)]
pub struct Resolved {
    /// Primary key.
    pub id: String,
    /// Node name.
    pub name: Option<String>,
    /// Prototype name.
    pub prototype: Option<String>,
    /// Property cells, all clean.
    pub properties: BTreeMap<String, Property>,
    /// Stored parent.
    pub parent: Option<Key>,
    /// Creation and modification times.
    pub timestamps: Option<(i64, i64)>,
    /// Whether the node is reached by id.
    pub anonymous: bool,
    /// Stored child keys, for embedded nodes.
    pub subnodes: Option<Vec<Key>>,
}

impl Resolved {
    /// Builds a clean node addressed by `key`.
    pub fn into_node(self, key: Key, mapping: Option<Arc<DbMapping>>) -> NodeRef {
        let mut node = Node::loaded(key, self.prototype, mapping, self.properties);
        node.set_name_raw(self.name);
        node.mark_clean();
        node.set_parent(self.parent.map(NodeHandle::from_key));
        node.set_anonymous(self.anonymous);
        if let Some((created, modified)) = self.timestamps {
            node.set_timestamps(created, modified);
        }
        if let Some(children) = self.subnodes {
            let handles = children.into_iter().map(NodeHandle::from_key).collect();
            node.put_subnodes(Subnodes::Plain(SubnodeList::from_handles(handles)), 0);
        }
        node.into_ref()
    }
}

/// Decodes an embedded record.
pub fn resolve_record(record: NodeRecord) -> Resolved {
    let properties = record
        .properties
        .into_iter()
        .map(|(name, value)| {
            let cell = Property::loaded(name.clone(), value.into_value());
            (name, cell)
        })
        .collect();
    Resolved {
        id: record.id,
        name: record.name,
        prototype: record.prototype,
        properties,
        parent: record.parent,
        timestamps: Some((record.created, record.last_modified)),
        anonymous: record.anonymous,
        subnodes: Some(record.subnodes),
    }
}

/// Mapping a row of `mapping` is instantiated with.
///
/// A row whose prototype column names a subtype of `mapping` sharing its
/// storage gets that subtype.
pub fn row_mapping(
    registry: &MappingRegistry,
    mapping: &Arc<DbMapping>,
    row: &Row,
) -> Arc<DbMapping> {
    let subtype = mapping
        .prototype_column()
        .and_then(|col| row.get(col))
        .and_then(SqlValue::to_text)
        .and_then(|name| registry.get(&name))
        .filter(|m| m.is_instance_of(mapping.type_name()) && m.storage_name() == mapping.storage_name());
    match subtype {
        Some(m) => Arc::clone(m),
        None => Arc::clone(mapping),
    }
}

/// Decodes a table row of `mapping`.
pub fn resolve_row(
    registry: &MappingRegistry,
    mapping: &DbMapping,
    row: &Row,
    types: &ColumnTypes,
) -> Result<Resolved> {
    let id_column = mapping
        .id_column()
        .ok_or_else(|| StoreError::Schema(format!("{} has no id column", mapping.type_name())))?;
    let id = row
        .get(id_column)
        .and_then(SqlValue::to_text)
        .ok_or_else(|| StoreError::Sql(format!("row of {} without primary key", mapping.type_name())))?;
    let name = mapping
        .name_column()
        .and_then(|col| row.get(col))
        .and_then(SqlValue::to_text);

    let mut properties = BTreeMap::new();
    for rel in mapping.relations() {
        if rel.is_virtual() || rel.kind() == RelationKind::Collection {
            continue;
        }
        let Some(column) = rel.column() else { continue };
        let Some(raw) = row.get(column).filter(|v| !v.is_null()) else {
            continue;
        };
        let column_type = types.get(&column.to_ascii_uppercase()).copied();
        let value = match rel.kind() {
            RelationKind::Reference if rel.uses_primary_key() => {
                let storage = rel
                    .target()
                    .and_then(|t| registry.get(t))
                    .and_then(|m| m.storage_name().map(str::to_owned));
                match raw.to_text() {
                    Some(target_id) => Value::Node(NodeHandle::from_key(Key::db(storage.as_deref(), target_id))),
                    None => continue,
                }
            }
            _ => sql_to_value(raw, column_type),
        };
        properties.insert(
            rel.prop_name().to_owned(),
            Property::loaded(rel.prop_name(), value),
        );
    }

    Ok(Resolved {
        id,
        name,
        prototype: mapping.prototype().map(str::to_owned),
        properties,
        parent: None,
        timestamps: None,
        anonymous: false,
        subnodes: None,
    })
}

/// Converts a column value according to the column's declared type.
pub fn sql_to_value(raw: &SqlValue, column_type: Option<ColumnType>) -> Value {
    match (column_type, raw) {
        (Some(ColumnType::Boolean), SqlValue::Int(i)) => Value::Bool(*i != 0),
        (Some(ColumnType::Boolean), SqlValue::Text(s)) => {
            Value::Bool(matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        }
        (Some(ColumnType::Timestamp), SqlValue::Int(i)) => Value::Date(*i),
        (Some(ColumnType::Timestamp), SqlValue::Real(f)) => Value::Date(*f as i64),
        (Some(ColumnType::Real), SqlValue::Int(i)) => Value::Float(*i as f64),
        (_, SqlValue::Int(i)) => Value::Int(*i),
        (_, SqlValue::Real(f)) => Value::Float(*f),
        (_, SqlValue::Text(s)) => Value::Str(s.clone()),
        (_, SqlValue::Blob(b)) => Value::Opaque(b.clone()),
        (_, SqlValue::Null) => Value::Str(String::new()),
    }
}

/// Converts a property value for a column of the given type.
///
/// Node references must already have been replaced by the referenced key
/// value.
pub fn value_to_sql(value: &Value, column_type: Option<ColumnType>) -> SqlValue {
    match (column_type, value) {
        (_, Value::Node(handle)) => match handle.key() {
            Some(key) => value_to_sql(&Value::Str(key.id().to_owned()), column_type),
            None => SqlValue::Null,
        },
        (Some(ColumnType::Integer), v) => match v.as_int() {
            Some(i) => SqlValue::Int(i),
            None => SqlValue::Text(v.to_text()),
        },
        (Some(ColumnType::Real), Value::Float(f)) => SqlValue::Real(*f),
        (Some(ColumnType::Real), v) => match v.as_int() {
            Some(i) => SqlValue::Real(i as f64),
            None => SqlValue::Text(v.to_text()),
        },
        (Some(ColumnType::Boolean), Value::Bool(b)) => SqlValue::Int(i64::from(*b)),
        (Some(ColumnType::Boolean), Value::Str(s)) => {
            SqlValue::Int(i64::from(s.eq_ignore_ascii_case("true") || s == "1"))
        }
        (Some(ColumnType::Timestamp), v) => match v.as_int() {
            Some(ms) => SqlValue::Int(ms),
            None => SqlValue::Text(v.to_text()),
        },
        (Some(ColumnType::Text), v) => SqlValue::Text(v.to_text()),
        (_, Value::Opaque(bytes)) => SqlValue::Blob(bytes.clone()),
        (_, Value::Str(s)) => SqlValue::Text(s.clone()),
        (_, Value::Bool(b)) => SqlValue::Int(i64::from(*b)),
        (_, Value::Date(ms)) | (_, Value::Int(ms)) => SqlValue::Int(*ms),
        (_, Value::Float(f)) => SqlValue::Real(*f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordValue;

    const SCHEMA: &str = r#"
        [types.Site]
        table = "SITE"
        id = "SITE_ID"
        name = "SITE_NAME"

        [types.Story]
        table = "STORY"
        id = "STORY_ID"
        prototype = "STORY_PROTO"

        [types.Story.properties.title]
        column = "STORY_TITLE"

        [types.Story.properties.published]
        column = "STORY_PUBLISHED"

        [types.Story.properties.created]
        column = "STORY_CREATED"

        [types.Story.properties.site]
        reference = "Site"
        column = "STORY_SITE"

        [types.Poll]
        extends = "Story"
    "#;

    fn story_row(proto: &str) -> Row {
        let columns: Arc<[String]> = ["STORY_ID", "STORY_TITLE", "STORY_PUBLISHED", "STORY_CREATED", "STORY_SITE", "STORY_PROTO"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Row::new(
            columns,
            vec![
                SqlValue::Int(7),
                SqlValue::Text("hello".into()),
                SqlValue::Int(1),
                SqlValue::Int(1_700_000_000_000),
                SqlValue::Int(3),
                SqlValue::Text(proto.into()),
            ],
        )
    }

    fn types() -> ColumnTypes {
        column_types(&[
            ColumnInfo { name: "STORY_PUBLISHED".into(), column_type: ColumnType::Boolean },
            ColumnInfo { name: "STORY_CREATED".into(), column_type: ColumnType::Timestamp },
        ])
    }

    #[test]
    fn resolves_typed_columns_and_references() -> Result<()> {
        let registry = MappingRegistry::from_toml_str(SCHEMA)?;
        let story = registry.get("Story").expect("story");
        let resolved = resolve_row(&registry, story, &story_row("Story"), &types())?;
        assert_eq!(resolved.id, "7");
        assert_eq!(resolved.properties["title"].value(), &Value::from("hello"));
        assert_eq!(resolved.properties["published"].value(), &Value::Bool(true));
        assert_eq!(resolved.properties["created"].value(), &Value::Date(1_700_000_000_000));
        assert_eq!(
            resolved.properties["site"].value().as_node().and_then(NodeHandle::key),
            Some(Key::db(Some("Site"), "3"))
        );
        assert!(resolved.properties.values().all(|p| !p.is_dirty()));
        Ok(())
    }

    #[test]
    fn prototype_column_selects_subtype() -> Result<()> {
        let registry = MappingRegistry::from_toml_str(SCHEMA)?;
        let story = registry.get("Story").expect("story");
        assert_eq!(row_mapping(&registry, story, &story_row("Poll")).type_name(), "Poll");
        assert_eq!(row_mapping(&registry, story, &story_row("Site")).type_name(), "Story");
        assert_eq!(row_mapping(&registry, story, &story_row("Nope")).type_name(), "Story");
        Ok(())
    }

    #[test]
    fn converts_values_by_column_type() {
        assert_eq!(value_to_sql(&Value::Bool(true), Some(ColumnType::Boolean)), SqlValue::Int(1));
        assert_eq!(value_to_sql(&Value::from("12"), Some(ColumnType::Integer)), SqlValue::Int(12));
        assert_eq!(value_to_sql(&Value::Int(3), Some(ColumnType::Text)), SqlValue::Text("3".into()));
        assert_eq!(value_to_sql(&Value::Date(5), Some(ColumnType::Timestamp)), SqlValue::Int(5));
        let handle = NodeHandle::from_key(Key::db(Some("Site"), "4"));
        assert_eq!(value_to_sql(&Value::Node(handle), Some(ColumnType::Integer)), SqlValue::Int(4));
    }

    #[test]
    fn record_cells_load_clean() {
        let mut properties = BTreeMap::new();
        properties.insert("n".to_owned(), RecordValue::Int(4));
        let record = NodeRecord {
            id: "9".into(),
            name: None,
            prototype: Some("Page".into()),
            parent: Some(Key::embedded("0")),
            created: 10,
            last_modified: 20,
            anonymous: true,
            subnodes: vec![Key::embedded("10")],
            properties,
        };
        let node = resolve_record(record).into_node(Key::embedded("9"), None);
        let node = node.read();
        assert_eq!(node.value("n"), Some(&Value::Int(4)));
        assert_eq!(node.last_modified(), 20);
        assert_eq!(node.subnodes().map(Subnodes::loaded_len), Some(1));
        assert!(!node.name_dirty());
    }
}
