use std::sync::Arc;

use super::DbMapping;

/// How a property is bound to storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationKind {
    /// Scalar column.
    Primitive,
    /// Foreign key: this object points at one other object.
    Reference,
    /// This object is pointed at by many others.
    Collection,
}

/// Pseudo column naming the primary key of the home node.
pub const ID_COLUMN: &str = "$id";
/// Pseudo column naming the name of the home node.
pub const NAME_COLUMN: &str = "$name";
/// Pseudo column naming the prototype of the home node.
pub const PROTOTYPE_COLUMN: &str = "$prototype";

/// One `local = foreign` equation between the home node and the target rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraint {
    /// Column (or pseudo column) on the home node.
    pub local: String,
    /// Column on the target table.
    pub foreign: String,
}

impl Constraint {
    /// Creates a constraint.
    pub fn new(local: impl Into<String>, foreign: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            foreign: foreign.into(),
        }
    }
}

/// Storage binding of one property, or of a node's children.
#[derive(Clone, Debug)]
pub struct Relation {
    pub(crate) prop_name: String,
    pub(crate) kind: RelationKind,
    pub(crate) column: Option<String>,
    pub(crate) target: Option<String>,
    pub(crate) relational: bool,
    pub(crate) uses_primary_key: bool,
    pub(crate) is_virtual: bool,
    pub(crate) readonly: bool,
    pub(crate) constraints: Vec<Constraint>,
    pub(crate) order: Option<String>,
    pub(crate) filter: Option<String>,
    pub(crate) group_by: Option<String>,
    pub(crate) group_order: Option<String>,
    pub(crate) grouped_on: Option<String>,
    pub(crate) accessor: Option<String>,
    pub(crate) max_size: Option<usize>,
    pub(crate) aggressive_loading: bool,
    pub(crate) aggressive_caching: bool,
    pub(crate) segmented: bool,
    pub(crate) update_criteria: Vec<String>,
    pub(crate) virtual_mapping: Option<Arc<DbMapping>>,
    pub(crate) group_mapping: Option<Arc<DbMapping>>,
}

impl Relation {
    pub(crate) fn new(prop_name: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            prop_name: prop_name.into(),
            kind,
            column: None,
            target: None,
            relational: false,
            uses_primary_key: false,
            is_virtual: false,
            readonly: false,
            constraints: Vec::new(),
            order: None,
            filter: None,
            group_by: None,
            group_order: None,
            grouped_on: None,
            accessor: None,
            max_size: None,
            aggressive_loading: false,
            aggressive_caching: false,
            segmented: false,
            update_criteria: Vec::new(),
            virtual_mapping: None,
            group_mapping: None,
        }
    }

    /// Name of the property this relation binds.
    pub fn prop_name(&self) -> &str {
        &self.prop_name
    }

    /// Relation kind.
    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// Local column for primitive and reference relations.
    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    /// Type name of the objects this relation points at.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Whether the target objects live in a relational table.
    pub fn is_relational(&self) -> bool {
        self.relational
    }

    /// Whether a reference matches the target's primary key.
    pub fn uses_primary_key(&self) -> bool {
        self.uses_primary_key
    }

    /// Whether the property is a synthesized container object.
    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    /// Whether the column must never be written.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Equations selecting the target rows.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// SQL ordering clause.
    pub fn order(&self) -> Option<&str> {
        self.order.as_deref()
    }

    /// Additional SQL filter.
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Column introducing an intermediate grouping layer.
    pub fn group_by(&self) -> Option<&str> {
        self.group_by.as_deref()
    }

    /// Column fixed to the group node's name in a synthesized group relation.
    pub fn grouped_on(&self) -> Option<&str> {
        self.grouped_on.as_deref()
    }

    /// Column used to reach a child by name.
    pub fn accessor(&self) -> Option<&str> {
        self.accessor.as_deref()
    }

    /// Maximum number of children fetched.
    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Whether children are fetched as full rows instead of id lists.
    pub fn aggressive_loading(&self) -> bool {
        self.aggressive_loading
    }

    /// Whether fetched children are kept in the shared cache eagerly.
    pub fn aggressive_caching(&self) -> bool {
        self.aggressive_caching
    }

    /// Whether the child list is materialized in segments.
    pub fn is_segmented(&self) -> bool {
        self.segmented
    }

    /// Columns used as watermarks for incremental refresh.
    pub fn update_criteria(&self) -> &[String] {
        &self.update_criteria
    }

    /// Mapping of the container synthesized for a virtual property.
    pub fn virtual_mapping(&self) -> Option<&Arc<DbMapping>> {
        self.virtual_mapping.as_ref()
    }

    /// Mapping of the group nodes introduced by `group_by`.
    pub fn group_mapping(&self) -> Option<&Arc<DbMapping>> {
        self.group_mapping.as_ref()
    }

    /// Whether the relation addresses objects rather than a scalar column.
    pub fn is_node_valued(&self) -> bool {
        self.kind != RelationKind::Primitive || self.is_virtual
    }

    /// Whether the local column is written on insert and update.
    pub fn is_persisted_column(&self) -> bool {
        !self.readonly
            && self.column.is_some()
            && matches!(self.kind, RelationKind::Primitive | RelationKind::Reference)
            && !self.is_virtual
    }

    /// Relation selecting the members of one group.
    pub(crate) fn for_group(&self) -> Relation {
        let mut rel = self.clone();
        rel.grouped_on = self.group_by.clone();
        rel.group_by = None;
        rel.group_order = None;
        rel.group_mapping = None;
        rel
    }
}
