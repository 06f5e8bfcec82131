use std::path::PathBuf;
use std::sync::Arc;

use hopdb::store::sql::{DataSource, SqlConnection, SqlValue, SqliteDataSource};
use hopdb::{
    Key, MappingRegistry, MemoryStore, NodeChangeListener, NodeManager, NodeRef, NodeState,
    Result, StoreConfig, StoreError, Transactor, Value,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use time::macros::datetime;

const SCHEMA: &str = r#"
    [types.Site]
    table = "SITE"
    id = "SITE_ID"
    name = "SITE_NAME"

    [types.Site.properties.title]
    column = "SITE_TITLE"

    [types.Site.properties.lead]
    reference = "Story"
    column = "SITE_LEAD"
    foreign = "STORY_NAME"

    [types.Site.properties.archive]
    virtual = true
    prototype = "Archive"
    children = { collection = "Story", local = "SITE_ID", foreign = "STORY_SITE", group = "STORY_DAY", group_order = "STORY_DAY" }

    [types.Site.children]
    collection = "Story"
    local = "SITE_ID"
    foreign = "STORY_SITE"
    order = "STORY_TITLE asc"
    accessname = "STORY_NAME"

    [types.Board]
    table = "SITE"
    id = "SITE_ID"
    name = "SITE_NAME"

    [types.Board.children]
    collection = "Story"
    local = "SITE_ID"
    foreign = "STORY_SITE"
    order = "STORY_ID"
    segmented = true

    [types.Ticker]
    table = "SITE"
    id = "SITE_ID"
    name = "SITE_NAME"

    [types.Ticker.children]
    collection = "Story"
    local = "SITE_ID"
    foreign = "STORY_SITE"
    update_criteria = ["STORY_MODIFIED"]

    [types.Story]
    table = "STORY"
    id = "STORY_ID"
    name = "STORY_NAME"
    prototype = "STORY_PROTO"

    [types.Story.properties.title]
    column = "STORY_TITLE"

    [types.Story.properties.day]
    column = "STORY_DAY"

    [types.Story.properties.score]
    column = "STORY_SCORE"

    [types.Story.properties.published]
    column = "STORY_PUBLISHED"

    [types.Story.properties.modified]
    column = "STORY_MODIFIED"

    [types.Story.properties.released]
    column = "STORY_RELEASED"

    [types.Story.properties.site]
    reference = "Site"
    column = "STORY_SITE"
"#;

const DDL: &[&str] = &[
    "CREATE TABLE SITE (SITE_ID INTEGER PRIMARY KEY, SITE_NAME VARCHAR(64), \
     SITE_TITLE VARCHAR(255), SITE_LEAD VARCHAR(64))",
    "CREATE TABLE STORY (STORY_ID INTEGER PRIMARY KEY, STORY_SITE INTEGER, \
     STORY_NAME VARCHAR(64), STORY_PROTO VARCHAR(32), STORY_TITLE VARCHAR(255), \
     STORY_DAY VARCHAR(8), STORY_SCORE REAL, STORY_PUBLISHED BOOLEAN, STORY_MODIFIED INTEGER, \
     STORY_RELEASED TIMESTAMP)",
];

struct Fixture {
    _dir: TempDir,
    source: SqliteDataSource,
}

impl Fixture {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path: PathBuf = dir.path().join("site.db");
        let source = SqliteDataSource::new("main", &path.display().to_string());
        let mut conn = source.connect()?;
        for ddl in DDL {
            conn.execute(ddl, &[])?;
        }
        Ok(Self { _dir: dir, source })
    }

    fn manager(&self) -> Result<Arc<NodeManager>> {
        self.manager_with(StoreConfig::new())
    }

    fn manager_with(&self, config: StoreConfig) -> Result<Arc<NodeManager>> {
        let registry = MappingRegistry::from_toml_str(SCHEMA)?;
        let manager = NodeManager::new(config, Arc::new(MemoryStore::new()), registry)?
            .with_data_source(Arc::new(self.source.clone()));
        Ok(Arc::new(manager))
    }

    fn conn(&self) -> Result<Box<dyn SqlConnection>> {
        self.source.connect()
    }
}

/// Site "news" with three stories spread over two days.
struct Seeded {
    site: NodeRef,
    alpha: NodeRef,
    beta: NodeRef,
    gamma: NodeRef,
}

fn seed(txn: &mut Transactor) -> Result<Seeded> {
    txn.begin("seed");
    let site = txn.create_node("Site", Some("news"));
    txn.set_string(&site, "title", "News")?;
    txn.make_persistable(&site)?;

    let mut story = |name: &str, title: &str, day: &str, score: f64, published: bool, modified: i64| {
        let node = txn.create_node("Story", Some(name));
        txn.set_string(&node, "title", title)?;
        txn.set_string(&node, "day", day)?;
        txn.set_float(&node, "score", score)?;
        txn.set_bool(&node, "published", published)?;
        txn.set_int(&node, "modified", modified)?;
        txn.add_node(&site, &node, None)?;
        Ok::<_, hopdb::StoreError>(node)
    };
    let beta = story("beta", "Beta", "20240101", 2.5, true, 10)?;
    let alpha = story("alpha", "Alpha", "20240101", 1.0, false, 20)?;
    let gamma = story("gamma", "Gamma", "20240102", 4.0, true, 30)?;
    txn.commit()?;
    Ok(Seeded { site, alpha, beta, gamma })
}

fn names(txn: &mut Transactor, handles: &[hopdb::NodeHandle]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        let node = txn.resolve(handle)?.expect("child resolves");
        let name = node.read().name().map(str::to_owned).unwrap_or_default();
        out.push(name);
    }
    Ok(out)
}

fn story_column(fx: &Fixture, name: &str, column: &str) -> Result<Option<SqlValue>> {
    let rows = fx.conn()?.query(
        &format!("SELECT {column} FROM STORY WHERE STORY_NAME = ?1"),
        &[SqlValue::Text(name.to_owned())],
    )?;
    Ok(rows.first().and_then(|row| row.value(0)).cloned())
}

#[test]
fn inserts_rows_with_typed_columns() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    assert_eq!(seeded.site.read().id(), "1");
    assert_eq!(seeded.site.read().state(), NodeState::Clean);
    assert_eq!(seeded.beta.read().key(), Some(&Key::db(Some("Story"), "1")));

    let rows = fx
        .conn()?
        .query("SELECT SITE_ID, SITE_NAME, SITE_TITLE FROM SITE", &[])?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("SITE_NAME"), Some(&SqlValue::Text("news".into())));
    assert_eq!(rows[0].get("SITE_TITLE"), Some(&SqlValue::Text("News".into())));

    assert_eq!(story_column(&fx, "beta", "STORY_SITE")?, Some(SqlValue::Int(1)));
    assert_eq!(story_column(&fx, "beta", "STORY_PROTO")?, Some(SqlValue::Text("Story".into())));
    assert_eq!(story_column(&fx, "beta", "STORY_PUBLISHED")?, Some(SqlValue::Int(1)));
    assert_eq!(story_column(&fx, "alpha", "STORY_PUBLISHED")?, Some(SqlValue::Int(0)));
    assert_eq!(story_column(&fx, "gamma", "STORY_SCORE")?, Some(SqlValue::Real(4.0)));
    Ok(())
}

#[test]
fn dates_and_floats_round_trip_through_columns() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    txn.begin("release");
    txn.set_date(&seeded.beta, "released", datetime!(2024-01-09 12:30:00.250 UTC))?;
    txn.set_float(&seeded.beta, "score", -0.125)?;
    let err = txn.set_float(&seeded.beta, "score", f64::NAN).unwrap_err();
    assert!(matches!(err, StoreError::TypeMismatch { .. }));
    txn.commit()?;

    assert_eq!(
        story_column(&fx, "beta", "STORY_RELEASED")?,
        Some(SqlValue::Int(1_704_803_400_250))
    );

    let mut reader = Transactor::new(fx.manager()?);
    let site = reader.get_node("1", "Site")?.expect("site row");
    let beta = reader.get_child(&site, "beta")?.expect("beta row");
    assert_eq!(beta.read().value("released"), Some(&Value::Date(1_704_803_400_250)));
    assert_eq!(beta.read().value("score"), Some(&Value::Float(-0.125)));
    Ok(())
}

#[test]
fn fresh_manager_reads_values_and_children() -> Result<()> {
    let fx = Fixture::new()?;
    seed(&mut Transactor::new(fx.manager()?))?;

    let mut txn = Transactor::new(fx.manager()?);
    let site = txn.get_node("1", "Site")?.expect("site row");
    assert_eq!(site.read().name(), Some("news"));
    assert_eq!(site.read().value("title"), Some(&Value::from("News")));

    let children = txn.subnodes(&site)?;
    assert_eq!(names(&mut txn, &children)?, ["alpha", "beta", "gamma"]);
    assert_eq!(txn.count_subnodes(&site)?, 3);

    let beta = txn.get_child(&site, "beta")?.expect("accessible by name");
    assert_eq!(beta.read().value("published"), Some(&Value::Bool(true)));
    assert_eq!(beta.read().value("score"), Some(&Value::Float(2.5)));
    assert_eq!(beta.read().value("modified"), Some(&Value::Int(10)));

    let owner = txn.get_node_property(&beta, "site")?.expect("site reference");
    assert!(Arc::ptr_eq(&owner, &site));
    let again = txn.get_child(&site, "beta")?.expect("cached lookup");
    assert!(Arc::ptr_eq(&again, &beta));
    assert!(txn.get_child(&site, "nope")?.is_none());
    assert!(txn.get_node("99", "Site")?.is_none());
    Ok(())
}

#[test]
fn aggressive_caching_fills_the_cache_with_children() -> Result<()> {
    let fx = Fixture::new()?;
    seed(&mut Transactor::new(fx.manager()?))?;

    let cached_children = |schema: &str| -> Result<usize> {
        let registry = MappingRegistry::from_toml_str(schema)?;
        let manager = Arc::new(
            NodeManager::new(StoreConfig::new(), Arc::new(MemoryStore::new()), registry)?
                .with_data_source(Arc::new(fx.source.clone())),
        );
        let mut txn = Transactor::new(Arc::clone(&manager));
        let site = txn.get_node("1", "Site")?.expect("site row");
        let children = txn.subnodes(&site)?;
        assert_eq!(children.len(), 3);
        Ok(children
            .iter()
            .filter_map(|h| h.key())
            .filter(|key| manager.cache().peek(key).is_some())
            .count())
    };

    assert_eq!(cached_children(SCHEMA)?, 0);
    let eager = SCHEMA.replace(
        "accessname = \"STORY_NAME\"",
        "accessname = \"STORY_NAME\"\n    cachemode = \"aggressive\"",
    );
    assert_eq!(cached_children(&eager)?, 3);
    Ok(())
}

#[test]
fn updates_write_only_changed_columns() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    let before = txn.subnodes(&seeded.site)?;
    assert_eq!(names(&mut txn, &before)?, ["alpha", "beta", "gamma"]);

    txn.begin("retitle");
    let alpha = txn.get_child(&seeded.site, "alpha")?.expect("alpha");
    assert!(Arc::ptr_eq(&alpha, &seeded.alpha));
    txn.set_string(&alpha, "title", "Zebra")?;
    fx.conn()?.execute(
        "UPDATE STORY SET STORY_DAY = '20991231' WHERE STORY_NAME = 'alpha'",
        &[],
    )?;
    txn.commit()?;

    assert_eq!(story_column(&fx, "alpha", "STORY_TITLE")?, Some(SqlValue::Text("Zebra".into())));
    assert_eq!(story_column(&fx, "alpha", "STORY_DAY")?, Some(SqlValue::Text("20991231".into())));

    let after = txn.subnodes(&seeded.site)?;
    assert_eq!(names(&mut txn, &after)?, ["beta", "gamma", "alpha"]);
    Ok(())
}

#[test]
fn unset_properties_are_written_as_null() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    txn.begin("clear score");
    txn.unset(&seeded.gamma, "score")?;
    txn.commit()?;
    assert_eq!(story_column(&fx, "gamma", "STORY_SCORE")?, Some(SqlValue::Null));
    Ok(())
}

#[test]
fn grouped_collections_expose_group_nodes() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    let archive = txn
        .get_node_property(&seeded.site, "archive")?
        .expect("virtual container");
    assert_eq!(archive.read().state(), NodeState::Virtual);
    let days = txn.subnodes(&archive)?;
    assert_eq!(names(&mut txn, &days)?, ["20240101", "20240102"]);

    let first_day = txn.get_child(&archive, "20240101")?.expect("group node");
    assert_eq!(txn.count_subnodes(&first_day)?, 2);
    let members = txn.subnodes(&first_day)?;
    let mut member_names = names(&mut txn, &members)?;
    member_names.sort();
    assert_eq!(member_names, ["alpha", "beta"]);
    assert!(txn.get_child(&archive, "19990101")?.is_none());

    txn.begin("new day");
    let delta = txn.create_node("Story", Some("delta"));
    txn.set_string(&delta, "title", "Delta")?;
    txn.set_string(&delta, "day", "20240103")?;
    let group = txn.add_node(&archive, &delta, None)?;
    assert_eq!(group.read().name(), Some("20240103"));
    txn.commit()?;

    assert_eq!(story_column(&fx, "delta", "STORY_SITE")?, Some(SqlValue::Int(1)));
    assert_eq!(story_column(&fx, "delta", "STORY_DAY")?, Some(SqlValue::Text("20240103".into())));
    let days = txn.subnodes(&archive)?;
    assert_eq!(names(&mut txn, &days)?, ["20240101", "20240102", "20240103"]);
    Ok(())
}

#[test]
fn aborted_groups_disappear() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    let archive = txn
        .get_node_property(&seeded.site, "archive")?
        .expect("virtual container");
    assert_eq!(txn.count_subnodes(&archive)?, 2);

    txn.begin("day that never was");
    let epsilon = txn.create_node("Story", Some("epsilon"));
    txn.set_string(&epsilon, "day", "20240109")?;
    txn.add_node(&archive, &epsilon, None)?;
    assert_eq!(txn.count_subnodes(&archive)?, 3);
    txn.abort();
    assert_eq!(archive.read().state(), NodeState::Invalid);

    let archive = txn
        .get_node_property(&seeded.site, "archive")?
        .expect("virtual container");
    let days = txn.subnodes(&archive)?;
    assert_eq!(names(&mut txn, &days)?, ["20240101", "20240102"]);
    assert_eq!(txn.count_subnodes(&archive)?, 2);
    assert!(txn.get_child(&archive, "20240109")?.is_none());
    Ok(())
}

#[test]
fn references_by_secondary_column_resolve() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    txn.begin("pick lead");
    txn.set_node(&seeded.site, "lead", &seeded.beta)?;
    txn.commit()?;

    let rows = fx.conn()?.query("SELECT SITE_LEAD FROM SITE WHERE SITE_ID = 1", &[])?;
    assert_eq!(rows[0].value(0), Some(&SqlValue::Text("beta".into())));

    let mut reader = Transactor::new(fx.manager()?);
    let site = reader.get_node("1", "Site")?.expect("site row");
    assert_eq!(site.read().value("lead"), Some(&Value::from("beta")));
    let lead = reader.get_node_property(&site, "lead")?.expect("lead story");
    assert_eq!(lead.read().value("title"), Some(&Value::from("Beta")));
    Ok(())
}

#[test]
fn rejects_values_that_do_not_fit_the_relation() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    txn.begin("bad writes");
    assert!(matches!(
        txn.set_string(&seeded.beta, "site", "1"),
        Err(hopdb::StoreError::TypeMismatch { .. })
    ));
    assert!(matches!(
        txn.set_node(&seeded.beta, "title", &seeded.site),
        Err(hopdb::StoreError::TypeMismatch { .. })
    ));
    assert!(matches!(
        txn.set_string(&seeded.site, "archive", "x"),
        Err(hopdb::StoreError::TypeMismatch { .. })
    ));
    assert!(txn.dirty_keys().is_empty());
    txn.abort();
    Ok(())
}

#[test]
fn deleting_a_row_updates_the_parent_list() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    txn.begin("drop gamma");
    txn.delete_node(&seeded.gamma)?;
    assert_eq!(txn.count_subnodes(&seeded.site)?, 2);
    txn.commit()?;

    let rows = fx.conn()?.query("SELECT COUNT(*) FROM STORY", &[])?;
    assert_eq!(rows[0].value(0), Some(&SqlValue::Int(2)));
    assert!(txn.get_child(&seeded.site, "gamma")?.is_none());
    let children = txn.subnodes(&seeded.site)?;
    assert_eq!(names(&mut txn, &children)?, ["alpha", "beta"]);
    Ok(())
}

#[test]
fn segmented_lists_page_through_the_backend() -> Result<()> {
    let fx = Fixture::new()?;
    seed(&mut Transactor::new(fx.manager()?))?;

    let mut txn = Transactor::new(fx.manager_with(StoreConfig::new().segment_size(2))?);
    let board = txn.get_node("1", "Board")?.expect("board row");
    assert_eq!(txn.count_subnodes(&board)?, 3);
    let third = txn.subnode_at(&board, 2)?.expect("second segment");
    assert_eq!(third.read().name(), Some("gamma"));
    let all = txn.subnodes(&board)?;
    assert_eq!(names(&mut txn, &all)?, ["beta", "alpha", "gamma"]);
    assert!(txn.subnode_at(&board, 3)?.is_none());
    Ok(())
}

#[test]
fn updateable_lists_fetch_only_newer_rows() -> Result<()> {
    let fx = Fixture::new()?;
    let mut txn = Transactor::new(fx.manager()?);
    let seeded = seed(&mut txn)?;

    let ticker = txn.get_node("1", "Ticker")?.expect("ticker row");
    let initial = txn.subnodes(&ticker)?;
    assert_eq!(names(&mut txn, &initial)?, ["beta", "alpha", "gamma"]);

    txn.begin("breaking");
    let late = txn.create_node("Story", Some("late"));
    txn.set_string(&late, "title", "Late")?;
    txn.set_string(&late, "day", "20240104")?;
    txn.set_int(&late, "modified", 40)?;
    txn.add_node(&seeded.site, &late, None)?;
    txn.commit()?;

    let refreshed = txn.subnodes(&ticker)?;
    assert_eq!(names(&mut txn, &refreshed)?, ["beta", "alpha", "gamma", "late"]);
    Ok(())
}

#[test]
fn schema_reload_evicts_changed_types_only() -> Result<()> {
    let fx = Fixture::new()?;
    let manager = fx.manager()?;
    let mut txn = Transactor::new(Arc::clone(&manager));
    let seeded = seed(&mut txn)?;
    let archive = txn
        .get_node_property(&seeded.site, "archive")?
        .expect("virtual container");

    let changed = SCHEMA.replace(
        "[types.Story.properties.site]",
        "[types.Story.properties.teaser]\n    column = \"STORY_TEASER\"\n\n    [types.Story.properties.site]",
    );
    let evicted = manager.reload_schema(&changed)?;
    assert!(evicted >= 4);
    assert_eq!(manager.registry().generation(), 2);

    assert_eq!(seeded.alpha.read().state(), NodeState::Invalid);
    assert_eq!(archive.read().state(), NodeState::Invalid);
    assert_eq!(seeded.site.read().state(), NodeState::Clean);

    let alpha = txn.get_child(&seeded.site, "alpha")?.expect("reloaded alpha");
    assert!(!Arc::ptr_eq(&alpha, &seeded.alpha));
    assert!(alpha
        .read()
        .mapping()
        .is_some_and(|m| m.relation("teaser").is_some()));
    Ok(())
}

#[derive(Default)]
struct Recorder {
    commits: Mutex<Vec<(usize, usize, usize)>>,
}

impl NodeChangeListener for Recorder {
    fn nodes_changed(&self, inserted: &[Key], updated: &[Key], deleted: &[Key]) {
        self.commits
            .lock()
            .push((inserted.len(), updated.len(), deleted.len()));
    }
}

#[test]
fn listeners_see_every_commit() -> Result<()> {
    let fx = Fixture::new()?;
    let manager = fx.manager()?;
    let recorder = Arc::new(Recorder::default());
    manager.add_listener(recorder.clone());

    let mut txn = Transactor::new(Arc::clone(&manager));
    let seeded = seed(&mut txn)?;

    txn.begin("edit");
    txn.set_string(&seeded.alpha, "title", "Alpha 2")?;
    txn.commit()?;

    txn.begin("delete");
    txn.delete_node(&seeded.gamma)?;
    txn.commit()?;

    txn.begin("read only");
    txn.commit()?;

    assert_eq!(*recorder.commits.lock(), [(4, 0, 0), (0, 1, 0), (0, 0, 1)]);
    Ok(())
}
