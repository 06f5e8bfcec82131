//! TOML type definitions as written by the application.
//!
//! ```toml
//! [types.Site]
//! table = "SITE"
//! datasource = "main"
//! id = "SITE_ID"
//!
//! [types.Site.children]
//! collection = "Story"
//! local = "SITE_ID"
//! foreign = "STORY_SITE"
//! order = "STORY_TITLE asc"
//! accessname = "STORY_NAME"
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;

/// A whole schema document.
#[derive(Clone, Debug, Default, Hash, Deserialize)]
pub struct SchemaDef {
    /// Type definitions keyed by type name.
    #[serde(default)]
    pub types: BTreeMap<String, MappingDef>,
}

/// Raw definition of one type, before the parent chain is resolved.
#[derive(Clone, Debug, Default, Hash, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingDef {
    /// Table holding the rows of this type.
    pub table: Option<String>,
    /// Data source the table lives in.
    pub datasource: Option<String>,
    /// Primary key column.
    pub id: Option<String>,
    /// Column holding the node name.
    pub name: Option<String>,
    /// Column discriminating subtypes sharing one table.
    pub prototype: Option<String>,
    /// Parent type whose definition this one extends.
    pub extends: Option<String>,
    /// Parent access paths, tried in order.
    #[serde(default)]
    pub parent: Vec<String>,
    /// ID generation strategy: `embedded`, `max` or `sequence:<sql>`.
    pub idgen: Option<String>,
    /// Property bindings keyed by property name.
    #[serde(default)]
    pub properties: BTreeMap<String, RelationDef>,
    /// Binding of the node's children.
    pub children: Option<RelationDef>,
}

/// Raw definition of one relation.
#[derive(Clone, Debug, Default, Hash, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationDef {
    /// Scalar or foreign key column.
    pub column: Option<String>,
    /// Target type of a reference.
    pub reference: Option<String>,
    /// Target type of a collection.
    pub collection: Option<String>,
    /// Synthesize a container object for this property.
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    /// Never write the column.
    #[serde(default)]
    pub readonly: bool,
    /// Shorthand for a single constraint's local column.
    pub local: Option<String>,
    /// Shorthand for a single constraint's foreign column.
    pub foreign: Option<String>,
    /// Additional constraints.
    #[serde(default)]
    pub constraints: Vec<ConstraintDef>,
    /// SQL ordering clause.
    pub order: Option<String>,
    /// Additional SQL filter.
    pub filter: Option<String>,
    /// Grouping column.
    pub group: Option<String>,
    /// Ordering of the group nodes.
    pub group_order: Option<String>,
    /// Prototype assigned to group nodes.
    pub group_prototype: Option<String>,
    /// Column used to reach children by name.
    pub accessname: Option<String>,
    /// Maximum number of children fetched.
    pub max_size: Option<usize>,
    /// `aggressive` to fetch full rows with the id list.
    pub loadmode: Option<String>,
    /// `aggressive` to keep fetched children in the shared cache.
    pub cachemode: Option<String>,
    /// Materialize the child list in segments.
    #[serde(default)]
    pub segmented: bool,
    /// Watermark columns for incremental refresh.
    #[serde(default)]
    pub update_criteria: Vec<String>,
    /// Prototype of the virtual container.
    pub prototype: Option<String>,
    /// Child relation of a virtual container.
    pub children: Option<Box<RelationDef>>,
}

/// Raw `local = foreign` equation.
#[derive(Clone, Debug, Hash, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstraintDef {
    /// Column on the home node.
    pub local: String,
    /// Column on the target table.
    pub foreign: String,
}
