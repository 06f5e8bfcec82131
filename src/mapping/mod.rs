//! Type mappings: how node types are bound to the embedded store or to tables.
//!
//! Definitions are parsed from TOML and flattened once: every [`DbMapping`]
//! already contains everything inherited from its `extends` chain, so
//! lookups never walk a parent chain at runtime.

mod relation;
pub mod schema;

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHasher};
use tracing::debug;

use crate::error::{Result, StoreError};

pub use relation::{
    Constraint, Relation, RelationKind, ID_COLUMN, NAME_COLUMN, PROTOTYPE_COLUMN,
};
pub use schema::{ConstraintDef, MappingDef, RelationDef, SchemaDef};

const DEFAULT_ID_COLUMN: &str = "ID";

/// How fresh primary keys are produced for a type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdStrategy {
    /// Process-wide counter persisted in the embedded store.
    Embedded,
    /// One more than the highest key in the table.
    Max,
    /// A query returning the next key, e.g. `SELECT nextval('seq')`.
    Sequence(String),
}

/// One way of finding a node's parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentInfo {
    /// The application root node.
    Root,
    /// A node-valued property, optionally followed by a virtual child of it.
    Property {
        /// Property holding the parent (or the parent's owner).
        name: String,
        /// Virtual property of that node acting as the actual parent.
        virtual_name: Option<String>,
    },
}

/// Effective, immutable schema of one type.
#[derive(Debug)]
pub struct DbMapping {
    type_name: String,
    prototype: Option<String>,
    ancestors: Vec<String>,
    table: Option<String>,
    data_source: Option<String>,
    storage_name: Option<String>,
    id_column: Option<String>,
    name_column: Option<String>,
    prototype_column: Option<String>,
    props: BTreeMap<String, Arc<Relation>>,
    columns: FxHashMap<String, String>,
    subnodes: Option<Arc<Relation>>,
    parents: Vec<ParentInfo>,
    id_strategy: IdStrategy,
    stamp: u64,
}

impl DbMapping {
    /// A mapping for nodes kept in the embedded store with no declared schema.
    pub fn embedded(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            prototype: Some(type_name.clone()),
            type_name,
            ancestors: Vec::new(),
            table: None,
            data_source: None,
            storage_name: None,
            id_column: None,
            name_column: None,
            prototype_column: None,
            props: BTreeMap::new(),
            columns: FxHashMap::default(),
            subnodes: None,
            parents: Vec::new(),
            id_strategy: IdStrategy::Embedded,
            stamp: 0,
        }
    }

    /// Type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Prototype assigned to nodes of this type.
    pub fn prototype(&self) -> Option<&str> {
        self.prototype.as_deref()
    }

    /// Whether this type is `name` or extends it.
    pub fn is_instance_of(&self, name: &str) -> bool {
        self.type_name == name || self.ancestors.iter().any(|a| a == name)
    }

    /// Table holding the rows of this type.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Data source holding the table.
    pub fn data_source(&self) -> Option<&str> {
        self.data_source.as_deref()
    }

    /// Whether nodes of this type live in a relational table.
    pub fn is_relational(&self) -> bool {
        self.table.is_some()
    }

    /// Name used in the keys of this type; `None` for the embedded store.
    pub fn storage_name(&self) -> Option<&str> {
        self.storage_name.as_deref()
    }

    /// Primary key column.
    pub fn id_column(&self) -> Option<&str> {
        self.id_column.as_deref()
    }

    /// Column holding the node name.
    pub fn name_column(&self) -> Option<&str> {
        self.name_column.as_deref()
    }

    /// Column discriminating subtypes.
    pub fn prototype_column(&self) -> Option<&str> {
        self.prototype_column.as_deref()
    }

    /// Relation declared for `prop`.
    pub fn relation(&self, prop: &str) -> Option<&Arc<Relation>> {
        self.props.get(prop)
    }

    /// All declared property relations.
    pub fn relations(&self) -> impl Iterator<Item = &Arc<Relation>> {
        self.props.values()
    }

    /// Property bound to `column` (case-insensitive).
    pub fn column_to_property(&self, column: &str) -> Option<&str> {
        self.columns
            .get(&column.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Column bound to `prop`.
    pub fn property_to_column(&self, prop: &str) -> Option<&str> {
        self.props.get(prop).and_then(|rel| rel.column())
    }

    /// Binding of the node's children.
    pub fn subnode_relation(&self) -> Option<&Arc<Relation>> {
        self.subnodes.as_ref()
    }

    /// Parent access paths.
    pub fn parents(&self) -> &[ParentInfo] {
        &self.parents
    }

    /// ID generation strategy.
    pub fn id_strategy(&self) -> &IdStrategy {
        &self.id_strategy
    }

    /// Registry generation in which this type's definition last changed.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    fn synthetic(type_name: String, prototype: Option<String>, subnodes: Relation, stamp: u64) -> Self {
        let mut mapping = DbMapping::embedded(type_name);
        mapping.prototype = prototype;
        mapping.subnodes = Some(Arc::new(subnodes));
        mapping.stamp = stamp;
        mapping
    }
}

/// All type mappings of one schema generation.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    generation: u64,
    types: BTreeMap<String, Arc<DbMapping>>,
    fingerprints: FxHashMap<String, u64>,
    storages: FxHashMap<String, String>,
}

impl MappingRegistry {
    /// Parses and flattens a TOML schema.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let schema: SchemaDef = toml::from_str(text)?;
        Self::from_defs(schema.types, 1, None)
    }

    /// Reads a TOML schema file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Builds the next generation from a new schema text.
    ///
    /// Types whose effective definition did not change keep their stamp.
    pub fn reload(&self, text: &str) -> Result<Self> {
        let schema: SchemaDef = toml::from_str(text)?;
        Self::from_defs(schema.types, self.generation + 1, Some(self))
    }

    /// Flattens raw definitions into effective mappings.
    pub fn from_defs(
        defs: BTreeMap<String, MappingDef>,
        generation: u64,
        previous: Option<&MappingRegistry>,
    ) -> Result<Self> {
        let mut effective = BTreeMap::new();
        for name in defs.keys() {
            flatten(name, &defs, &mut Vec::new(), &mut effective)?;
        }

        let mut fingerprints = FxHashMap::default();
        for (name, eff) in &effective {
            let mut hasher = FxHasher::default();
            eff.hash(&mut hasher);
            fingerprints.insert(name.clone(), hasher.finish());
        }

        let mut types = BTreeMap::new();
        let mut storages = FxHashMap::default();
        for (name, eff) in &effective {
            let stamp = match previous {
                Some(prev) if prev.fingerprints.get(name) == fingerprints.get(name) => prev
                    .types
                    .get(name)
                    .map_or(generation, |m| m.stamp),
                _ => generation,
            };
            let mapping = build_mapping(name, eff, &effective, stamp)?;
            if let (Some(storage), Some(_)) = (&mapping.storage_name, &mapping.table) {
                if eff.storage_owner.as_deref() == Some(name.as_str()) {
                    storages.insert(storage.clone(), name.clone());
                }
            }
            types.insert(name.clone(), Arc::new(mapping));
        }
        debug!(generation, types = types.len(), "schema flattened");
        Ok(Self {
            generation,
            types,
            fingerprints,
            storages,
        })
    }

    /// Schema generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mapping of `type_name`.
    pub fn get(&self, type_name: &str) -> Option<&Arc<DbMapping>> {
        self.types.get(type_name)
    }

    /// Mapping owning the storage named in a key.
    pub fn for_storage(&self, storage: &str) -> Option<&Arc<DbMapping>> {
        self.storages.get(storage).and_then(|name| self.types.get(name))
    }

    /// All mappings.
    pub fn mappings(&self) -> impl Iterator<Item = &Arc<DbMapping>> {
        self.types.values()
    }
}

#[derive(Clone, Debug, Hash)]
struct Effective {
    def: MappingDef,
    ancestors: Vec<String>,
    storage_owner: Option<String>,
}

fn flatten(
    name: &str,
    defs: &BTreeMap<String, MappingDef>,
    stack: &mut Vec<String>,
    out: &mut BTreeMap<String, Effective>,
) -> Result<Effective> {
    if let Some(done) = out.get(name) {
        return Ok(done.clone());
    }
    if stack.iter().any(|s| s == name) {
        return Err(StoreError::Schema(format!(
            "cyclic extends chain: {} -> {name}",
            stack.join(" -> ")
        )));
    }
    let def = defs
        .get(name)
        .ok_or_else(|| StoreError::Schema(format!("unknown type {name}")))?;

    let effective = match &def.extends {
        None => Effective {
            def: def.clone(),
            ancestors: Vec::new(),
            storage_owner: def.table.as_ref().map(|_| name.to_owned()),
        },
        Some(parent_name) => {
            stack.push(name.to_owned());
            let parent = flatten(parent_name, defs, stack, out)?;
            stack.pop();
            let mut merged = parent.def.clone();
            let inherits_storage = def.table.is_none() || def.table == parent.def.table;
            merged.table = def.table.clone().or(merged.table);
            merged.datasource = def.datasource.clone().or(merged.datasource);
            merged.id = def.id.clone().or(merged.id);
            merged.name = def.name.clone().or(merged.name);
            merged.prototype = def.prototype.clone().or(merged.prototype);
            merged.idgen = def.idgen.clone().or(merged.idgen);
            if !def.parent.is_empty() {
                merged.parent = def.parent.clone();
            }
            for (prop, rel) in &def.properties {
                merged.properties.insert(prop.clone(), rel.clone());
            }
            if def.children.is_some() {
                merged.children = def.children.clone();
            }
            merged.extends = None;
            let mut ancestors = vec![parent_name.clone()];
            ancestors.extend(parent.ancestors.iter().cloned());
            let storage_owner = if inherits_storage {
                parent.storage_owner.clone()
            } else {
                Some(name.to_owned())
            };
            Effective {
                def: merged,
                ancestors,
                storage_owner,
            }
        }
    };
    out.insert(name.to_owned(), effective.clone());
    Ok(effective)
}

fn build_mapping(
    name: &str,
    eff: &Effective,
    all: &BTreeMap<String, Effective>,
    stamp: u64,
) -> Result<DbMapping> {
    let def = &eff.def;
    let relational = def.table.is_some();
    let storage_name = if relational {
        eff.storage_owner.clone()
    } else {
        None
    };

    let mut props = BTreeMap::new();
    let mut columns = FxHashMap::default();
    for (prop, rel_def) in &def.properties {
        let rel = build_relation(name, prop, rel_def, all, stamp)?;
        if let Some(column) = rel.column() {
            if !rel.is_virtual() && rel.kind() != RelationKind::Collection {
                columns.insert(column.to_ascii_uppercase(), prop.clone());
            }
        }
        props.insert(prop.clone(), Arc::new(rel));
    }
    let subnodes = match &def.children {
        Some(child_def) => Some(Arc::new(build_relation(name, "_children", child_def, all, stamp)?)),
        None => None,
    };

    let id_strategy = match def.idgen.as_deref() {
        None if relational => IdStrategy::Max,
        None | Some("embedded") => IdStrategy::Embedded,
        Some("max") => IdStrategy::Max,
        Some(other) => match other.strip_prefix("sequence:") {
            Some(sql) => IdStrategy::Sequence(sql.trim().to_owned()),
            None => {
                return Err(StoreError::Schema(format!(
                    "{name}: unknown idgen strategy {other}"
                )))
            }
        },
    };
    if id_strategy != IdStrategy::Embedded && !relational {
        return Err(StoreError::Schema(format!(
            "{name}: idgen {id_strategy:?} requires a table"
        )));
    }

    Ok(DbMapping {
        type_name: name.to_owned(),
        prototype: Some(name.to_owned()),
        ancestors: eff.ancestors.clone(),
        table: def.table.clone(),
        data_source: def.datasource.clone(),
        storage_name,
        id_column: if relational {
            Some(def.id.clone().unwrap_or_else(|| DEFAULT_ID_COLUMN.to_owned()))
        } else {
            None
        },
        name_column: def.name.clone(),
        prototype_column: def.prototype.clone(),
        props,
        columns,
        subnodes,
        parents: def.parent.iter().map(|p| parse_parent(p)).collect(),
        id_strategy,
        stamp,
    })
}

fn parse_parent(spec: &str) -> ParentInfo {
    let spec = spec.trim();
    if spec.eq_ignore_ascii_case("root") {
        return ParentInfo::Root;
    }
    match spec.split_once('.') {
        Some((prop, virt)) => ParentInfo::Property {
            name: prop.to_owned(),
            virtual_name: Some(virt.to_owned()),
        },
        None => ParentInfo::Property {
            name: spec.to_owned(),
            virtual_name: None,
        },
    }
}

fn target_info<'a>(
    owner: &str,
    target: &str,
    all: &'a BTreeMap<String, Effective>,
) -> Result<&'a Effective> {
    all.get(target).ok_or_else(|| {
        StoreError::Schema(format!("{owner}: relation targets unknown type {target}"))
    })
}

fn build_relation(
    owner: &str,
    prop: &str,
    def: &RelationDef,
    all: &BTreeMap<String, Effective>,
    stamp: u64,
) -> Result<Relation> {
    if def.is_virtual {
        let child_def = def.children.as_deref().ok_or_else(|| {
            StoreError::Schema(format!("{owner}.{prop}: virtual property needs children"))
        })?;
        let children = build_relation(owner, &format!("{prop}._children"), child_def, all, stamp)?;
        if !children.is_relational() {
            return Err(StoreError::Schema(format!(
                "{owner}.{prop}: virtual collections require a relational target"
            )));
        }
        let mut rel = Relation::new(prop, RelationKind::Collection);
        rel.is_virtual = true;
        rel.target = children.target.clone();
        rel.relational = true;
        rel.virtual_mapping = Some(Arc::new(DbMapping::synthetic(
            format!("{owner}.{prop}"),
            def.prototype.clone(),
            children,
            stamp,
        )));
        return Ok(rel);
    }

    if let Some(target) = &def.reference {
        let target_eff = target_info(owner, target, all)?;
        let column = def.column.clone().or_else(|| def.local.clone()).ok_or_else(|| {
            StoreError::Schema(format!("{owner}.{prop}: reference needs a column"))
        })?;
        let target_id = target_eff
            .def
            .id
            .clone()
            .unwrap_or_else(|| DEFAULT_ID_COLUMN.to_owned());
        let foreign = def.foreign.clone().unwrap_or_else(|| ID_COLUMN.to_owned());
        let mut rel = Relation::new(prop, RelationKind::Reference);
        rel.uses_primary_key = foreign == ID_COLUMN || foreign.eq_ignore_ascii_case(&target_id);
        rel.constraints = vec![Constraint::new(column.clone(), foreign)];
        rel.column = Some(column);
        rel.target = Some(target.clone());
        rel.relational = target_eff.def.table.is_some();
        rel.readonly = def.readonly;
        return Ok(rel);
    }

    if let Some(target) = &def.collection {
        let target_eff = target_info(owner, target, all)?;
        let mut rel = Relation::new(prop, RelationKind::Collection);
        rel.target = Some(target.clone());
        rel.relational = target_eff.def.table.is_some();
        if let (Some(local), Some(foreign)) = (&def.local, &def.foreign) {
            rel.constraints.push(Constraint::new(local.clone(), foreign.clone()));
        }
        for c in &def.constraints {
            rel.constraints.push(Constraint::new(c.local.clone(), c.foreign.clone()));
        }
        rel.order = def.order.clone();
        rel.filter = def.filter.clone();
        rel.group_by = def.group.clone();
        rel.group_order = def.group_order.clone();
        rel.accessor = def.accessname.clone();
        rel.max_size = def.max_size;
        rel.aggressive_loading = is_aggressive(def.loadmode.as_deref());
        rel.aggressive_caching = is_aggressive(def.cachemode.as_deref());
        rel.segmented = def.segmented;
        rel.update_criteria = def.update_criteria.clone();
        rel.readonly = def.readonly;
        if !rel.relational
            && (rel.group_by.is_some()
                || rel.segmented
                || !rel.update_criteria.is_empty()
                || rel.filter.is_some())
        {
            return Err(StoreError::Schema(format!(
                "{owner}.{prop}: group, filter, segmented and update_criteria require a relational target"
            )));
        }
        if rel.group_by.is_some() {
            let group_rel = rel.for_group();
            rel.group_mapping = Some(Arc::new(DbMapping::synthetic(
                format!("{owner}.{prop}.group"),
                def.group_prototype.clone(),
                group_rel,
                stamp,
            )));
        }
        return Ok(rel);
    }

    let mut rel = Relation::new(prop, RelationKind::Primitive);
    rel.column = Some(def.column.clone().unwrap_or_else(|| prop.to_owned()));
    rel.readonly = def.readonly;
    Ok(rel)
}

fn is_aggressive(mode: Option<&str>) -> bool {
    mode.is_some_and(|m| m.eq_ignore_ascii_case("aggressive"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
        [types.Site]
        table = "SITE"
        datasource = "main"
        id = "SITE_ID"
        name = "SITE_NAME"
        parent = ["root"]

        [types.Site.properties.title]
        column = "SITE_TITLE"

        [types.Site.children]
        collection = "Story"
        local = "SITE_ID"
        foreign = "STORY_SITE"
        order = "STORY_TITLE asc"
        accessname = "STORY_NAME"

        [types.Site.properties.archive]
        virtual = true
        prototype = "Archive"
        children = { collection = "Story", local = "SITE_ID", foreign = "STORY_SITE", group = "STORY_DAY" }

        [types.Story]
        table = "STORY"
        datasource = "main"
        id = "STORY_ID"
        prototype = "STORY_PROTO"
        parent = ["site", "root"]

        [types.Story.properties.title]
        column = "STORY_TITLE"

        [types.Story.properties.site]
        reference = "Site"
        column = "STORY_SITE"
        foreign = "SITE_ID"

        [types.Poll]
        extends = "Story"

        [types.Poll.properties.question]
        column = "POLL_QUESTION"

        [types.Page]

        [types.Page.properties.body]
    "#;

    #[test]
    fn flattens_extends_chain() -> Result<()> {
        let registry = MappingRegistry::from_toml_str(SCHEMA)?;
        let poll = registry.get("Poll").expect("poll mapping");
        assert_eq!(poll.table(), Some("STORY"));
        assert_eq!(poll.storage_name(), Some("Story"));
        assert_eq!(poll.id_column(), Some("STORY_ID"));
        assert!(poll.is_instance_of("Story"));
        assert!(poll.relation("title").is_some());
        assert_eq!(poll.column_to_property("poll_question"), Some("question"));
        assert_eq!(
            registry.for_storage("Story").map(|m| m.type_name()),
            Some("Story")
        );
        Ok(())
    }

    #[test]
    fn builds_relations() -> Result<()> {
        let registry = MappingRegistry::from_toml_str(SCHEMA)?;
        let story = registry.get("Story").expect("story mapping");
        let site = story.relation("site").expect("site relation");
        assert_eq!(site.kind(), RelationKind::Reference);
        assert!(site.uses_primary_key());
        assert!(site.is_relational());
        assert_eq!(story.parents().len(), 2);

        let children = registry
            .get("Site")
            .and_then(|m| m.subnode_relation())
            .expect("site children");
        assert_eq!(children.constraints(), &[Constraint::new("SITE_ID", "STORY_SITE")]);
        assert_eq!(children.accessor(), Some("STORY_NAME"));

        let archive = registry.get("Site").and_then(|m| m.relation("archive")).expect("archive");
        let vmap = archive.virtual_mapping().expect("virtual mapping");
        let group_rel = vmap.subnode_relation().expect("virtual children");
        assert_eq!(group_rel.group_by(), Some("STORY_DAY"));
        let group_mapping = group_rel.group_mapping().expect("group mapping");
        assert_eq!(
            group_mapping.subnode_relation().and_then(|r| r.grouped_on()),
            Some("STORY_DAY")
        );

        let page = registry.get("Page").expect("page mapping");
        assert!(!page.is_relational());
        assert_eq!(page.id_strategy(), &IdStrategy::Embedded);
        assert_eq!(page.property_to_column("body"), Some("body"));
        Ok(())
    }

    #[test]
    fn rejects_cycles_and_embedded_grouping() {
        let cyclic = r#"
            [types.A]
            extends = "B"
            [types.B]
            extends = "A"
        "#;
        assert!(matches!(
            MappingRegistry::from_toml_str(cyclic),
            Err(StoreError::Schema(_))
        ));

        let grouped = r#"
            [types.Folder.children]
            collection = "Folder"
            group = "kind"
        "#;
        assert!(matches!(
            MappingRegistry::from_toml_str(grouped),
            Err(StoreError::Schema(_))
        ));
    }

    #[test]
    fn reload_keeps_stamps_of_unchanged_types() -> Result<()> {
        let first = MappingRegistry::from_toml_str(SCHEMA)?;
        let changed = SCHEMA.replace("POLL_QUESTION", "POLL_Q");
        let second = first.reload(&changed)?;
        assert_eq!(second.generation(), 2);
        assert_eq!(second.get("Site").map(|m| m.stamp()), Some(1));
        assert_eq!(second.get("Poll").map(|m| m.stamp()), Some(2));
        Ok(())
    }
}
