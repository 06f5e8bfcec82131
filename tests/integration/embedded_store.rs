use std::path::Path;
use std::sync::Arc;

use hopdb::{NodeManager, NodeRef, NodeState, Result, StoreConfig, StoreError, Transactor, Value};
use time::macros::datetime;

fn open(dir: &Path) -> Result<Arc<NodeManager>> {
    Ok(Arc::new(NodeManager::open(StoreConfig::new().embedded_path(dir))?))
}

fn text(node: &NodeRef, name: &str) -> Option<String> {
    node.read().value(name).and_then(Value::as_str).map(str::to_owned)
}

#[test]
fn reserved_records_exist_in_fresh_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = open(dir.path())?;
    let mut txn = Transactor::new(manager);

    let root = txn.root()?;
    assert_eq!(root.read().id(), "0");
    assert_eq!(root.read().state(), NodeState::Clean);

    let users = txn.user_root()?;
    assert_eq!(users.read().name(), Some("users"));
    let parent = txn.parent_of(&users)?.expect("user root has a parent");
    assert!(Arc::ptr_eq(&parent, &root));
    Ok(())
}

#[test]
fn new_nodes_become_clean_on_commit_and_survive_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let page_id;
    {
        let mut txn = Transactor::new(open(dir.path())?);
        txn.begin("create page");
        let root = txn.root()?;
        let page = txn.create_node("Page", Some("home"));
        txn.set_string(&page, "title", "Welcome")?;
        txn.set_int(&page, "views", 3)?;
        assert_eq!(page.read().state(), NodeState::Transient);

        txn.add_node(&root, &page, None)?;
        assert_eq!(page.read().state(), NodeState::New);
        page_id = page.read().id().to_owned();

        txn.commit()?;
        assert_eq!(page.read().state(), NodeState::Clean);
        assert!(!txn.is_active());
    }

    let mut txn = Transactor::new(open(dir.path())?);
    let page = txn.get_node(&page_id, "Page")?.expect("page was stored");
    assert_eq!(text(&page, "title").as_deref(), Some("Welcome"));
    assert_eq!(page.read().value("views"), Some(&Value::Int(3)));

    let root = txn.root()?;
    assert_eq!(txn.count_subnodes(&root)?, 1);
    let child = txn.get_child(&root, "home")?.expect("reachable by name");
    assert!(Arc::ptr_eq(&child, &page));
    Ok(())
}

#[test]
fn id_counter_continues_after_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let first = {
        let mut txn = Transactor::new(open(dir.path())?);
        txn.begin("first");
        let node = txn.create_node("Page", None);
        txn.make_persistable(&node)?;
        txn.commit()?;
        let id = node.read().id().parse::<u64>().expect("numeric id");
        id
    };

    let mut txn = Transactor::new(open(dir.path())?);
    txn.begin("second");
    let node = txn.create_node("Page", None);
    txn.make_persistable(&node)?;
    let second: u64 = node.read().id().parse().expect("numeric id");
    txn.commit()?;
    assert!(first > 1);
    assert!(second > first);
    Ok(())
}

#[test]
fn deleted_nodes_are_gone_after_commit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut txn = Transactor::new(open(dir.path())?);
    txn.begin("create");
    let root = txn.root()?;
    let page = txn.create_node("Page", Some("doomed"));
    txn.add_node(&root, &page, None)?;
    txn.commit()?;
    let id = page.read().id().to_owned();

    txn.begin("delete");
    txn.delete_node(&page)?;
    assert_eq!(page.read().state(), NodeState::Deleted);
    txn.commit()?;

    assert!(txn.get_node(&id, "Page")?.is_none());
    assert!(txn.get_child(&root, "doomed")?.is_none());
    assert_eq!(txn.count_subnodes(&root)?, 0);

    let mut reopened = Transactor::new(open(dir.path())?);
    assert!(reopened.get_node(&id, "Page")?.is_none());
    Ok(())
}

#[test]
fn deleting_a_node_cascades_to_anonymous_children() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut txn = Transactor::new(open(dir.path())?);
    txn.begin("build");
    let root = txn.root()?;
    let folder = txn.create_node("Folder", Some("docs"));
    txn.add_node(&root, &folder, None)?;
    let anonymous = txn.create_node("Page", None);
    txn.add_node(&folder, &anonymous, None)?;
    let named = txn.create_node("Page", Some("keep"));
    txn.add_node(&folder, &named, None)?;
    txn.commit()?;
    let anonymous_id = anonymous.read().id().to_owned();
    let named_id = named.read().id().to_owned();

    txn.begin("delete folder");
    txn.delete_node(&folder)?;
    txn.commit()?;

    assert!(txn.get_node(&anonymous_id, "Page")?.is_none());
    let survivor = txn.get_node(&named_id, "Page")?.expect("named child stays");
    assert_eq!(survivor.read().name(), Some("keep"));
    Ok(())
}

#[test]
fn abort_evicts_dirty_nodes() -> Result<()> {
    let manager = Arc::new(NodeManager::open(StoreConfig::new())?);
    let mut txn = Transactor::new(Arc::clone(&manager));
    txn.begin("create");
    let root = txn.root()?;
    let page = txn.create_node("Page", Some("draft"));
    txn.set_string(&page, "title", "original")?;
    txn.add_node(&root, &page, None)?;
    txn.commit()?;
    let id = page.read().id().to_owned();

    txn.begin("edit");
    txn.set_string(&page, "title", "changed")?;
    assert_eq!(page.read().state(), NodeState::Modified);
    txn.abort();

    assert_eq!(page.read().state(), NodeState::Invalid);
    txn.begin("edit stale");
    let err = txn.set_string(&page, "title", "again").unwrap_err();
    assert!(matches!(err, StoreError::InvalidNode(_)));
    assert!(err.is_retryable());

    let fresh = txn.get_node(&id, "Page")?.expect("stored copy");
    assert!(!Arc::ptr_eq(&fresh, &page));
    assert_eq!(text(&fresh, "title").as_deref(), Some("original"));
    txn.abort();
    Ok(())
}

#[test]
fn aborting_a_creation_leaves_no_record() -> Result<()> {
    let manager = Arc::new(NodeManager::open(StoreConfig::new())?);
    let mut txn = Transactor::new(manager);
    txn.begin("create");
    let node = txn.create_node("Page", None);
    txn.make_persistable(&node)?;
    let id = node.read().id().to_owned();
    txn.abort();

    assert!(txn.get_node(&id, "Page")?.is_none());
    Ok(())
}

#[test]
fn ordered_subnodes_follow_the_expression() -> Result<()> {
    let manager = Arc::new(NodeManager::open(StoreConfig::new())?);
    let mut txn = Transactor::new(manager);
    txn.begin("fill");
    let root = txn.root()?;
    for (name, title, rank) in [("b", "Banana", 2), ("a", "Apple", 3), ("c", "Cherry", 1)] {
        let page = txn.create_node("Page", Some(name));
        txn.set_string(&page, "title", title)?;
        txn.set_int(&page, "rank", rank)?;
        txn.add_node(&root, &page, None)?;
    }
    txn.commit()?;

    let names = |txn: &mut Transactor, expr: &str| -> Result<Vec<String>> {
        let root = txn.root()?;
        let mut out = Vec::new();
        for handle in txn.ordered_subnodes(&root, expr)? {
            let node = txn.resolve(&handle)?.expect("child resolves");
            let name = node.read().name().map(str::to_owned).unwrap_or_default();
            out.push(name);
        }
        Ok(out)
    };

    assert_eq!(names(&mut txn, "title asc")?, ["a", "b", "c"]);
    assert_eq!(names(&mut txn, "rank desc")?, ["a", "b", "c"]);
    assert_eq!(names(&mut txn, "rank")?, ["c", "b", "a"]);

    let stored: Vec<String> = txn
        .subnodes(&root)?
        .iter()
        .map(|h| {
            let node = txn.resolve(h)?.expect("child resolves");
            let name = node.read().name().map(str::to_owned).unwrap_or_default();
            Ok(name)
        })
        .collect::<Result<_>>()?;
    assert_eq!(stored, ["b", "a", "c"]);
    Ok(())
}

#[test]
fn sorted_views_follow_changed_values() -> Result<()> {
    let manager = Arc::new(NodeManager::open(StoreConfig::new())?);
    let mut txn = Transactor::new(manager);
    txn.begin("fill");
    let root = txn.root()?;
    let mut pages = Vec::new();
    for (name, rank) in [("a", 1), ("b", 2), ("c", 3)] {
        let page = txn.create_node("Page", Some(name));
        txn.set_int(&page, "rank", rank)?;
        txn.add_node(&root, &page, None)?;
        pages.push(page);
    }
    txn.commit()?;

    txn.begin("rerank");
    let order = |txn: &mut Transactor| -> Result<Vec<String>> {
        let root = txn.root()?;
        let mut out = Vec::new();
        for handle in txn.ordered_subnodes(&root, "rank")? {
            let node = txn.resolve(&handle)?.expect("child resolves");
            out.push(node.read().name().map(str::to_owned).unwrap_or_default());
        }
        Ok(out)
    };
    assert_eq!(order(&mut txn)?, ["a", "b", "c"]);

    txn.set_int(&pages[0], "rank", 9)?;
    assert_eq!(order(&mut txn)?, ["b", "c", "a"]);

    txn.unset(&pages[2], "rank")?;
    assert_eq!(order(&mut txn)?, ["c", "b", "a"]);
    txn.commit()?;
    Ok(())
}

#[test]
fn add_node_honors_position() -> Result<()> {
    let manager = Arc::new(NodeManager::open(StoreConfig::new())?);
    let mut txn = Transactor::new(manager);
    txn.begin("fill");
    let root = txn.root()?;
    let last = txn.create_node("Page", Some("last"));
    txn.add_node(&root, &last, None)?;
    let first = txn.create_node("Page", Some("first"));
    txn.add_node(&root, &first, Some(0))?;

    let at_zero = txn.subnode_at(&root, 0)?.expect("first slot");
    assert!(Arc::ptr_eq(&at_zero, &first));
    assert!(txn.subnode_at(&root, 2)?.is_none());
    txn.commit()?;
    Ok(())
}

#[test]
fn node_values_are_adopted_and_persisted() -> Result<()> {
    let manager = Arc::new(NodeManager::open(StoreConfig::new())?);
    let mut txn = Transactor::new(manager);
    txn.begin("attach");
    let root = txn.root()?;
    let page = txn.create_node("Page", Some("gallery"));
    txn.add_node(&root, &page, None)?;
    let image = txn.create_node("Image", None);
    txn.set_opaque(&image, "bytes", vec![0x89, 0x50, 0x4e, 0x47])?;
    txn.set_node(&page, "cover", &image)?;

    assert_eq!(image.read().state(), NodeState::New);
    assert_eq!(image.read().name(), Some("cover"));
    txn.commit()?;

    let cover = txn.get_node_property(&page, "cover")?.expect("cover resolves");
    assert!(Arc::ptr_eq(&cover, &image));
    let owner = txn.parent_of(&cover)?.expect("adopted");
    assert!(Arc::ptr_eq(&owner, &page));
    assert_eq!(
        cover.read().value("bytes"),
        Some(&Value::Opaque(vec![0x89, 0x50, 0x4e, 0x47]))
    );
    Ok(())
}

#[test]
fn properties_inherit_along_the_parent_chain() -> Result<()> {
    let manager = Arc::new(NodeManager::open(StoreConfig::new())?);
    let mut txn = Transactor::new(manager);
    txn.begin("fill");
    let root = txn.root()?;
    txn.set_string(&root, "skin", "dark")?;
    let section = txn.create_node("Folder", Some("blog"));
    txn.add_node(&root, &section, None)?;
    let post = txn.create_node("Page", Some("hello"));
    txn.add_node(&section, &post, None)?;
    txn.commit()?;

    assert_eq!(txn.get_property(&post, "skin", false)?, None);
    assert_eq!(txn.get_property(&post, "skin", true)?, Some(Value::from("dark")));
    Ok(())
}

#[test]
fn renaming_changes_child_lookup() -> Result<()> {
    let manager = Arc::new(NodeManager::open(StoreConfig::new())?);
    let mut txn = Transactor::new(manager);
    txn.begin("fill");
    let root = txn.root()?;
    let page = txn.create_node("Page", Some("old"));
    txn.add_node(&root, &page, None)?;
    txn.commit()?;

    txn.begin("rename");
    txn.set_name(&page, "new")?;
    txn.commit()?;

    assert!(txn.get_child(&root, "old")?.is_none());
    let found = txn.get_child(&root, "new")?.expect("renamed child");
    assert!(Arc::ptr_eq(&found, &page));
    Ok(())
}

#[test]
fn typed_values_survive_eviction_and_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = open(dir.path())?;
    let mut txn = Transactor::new(Arc::clone(&manager));
    txn.begin("typed");
    let root = txn.root()?;
    let author = txn.create_node("Person", Some("ada"));
    txn.add_node(&root, &author, None)?;
    let page = txn.create_node("Page", Some("typed"));
    txn.add_node(&root, &page, None)?;
    txn.set_string(&page, "title", "Typed")?;
    txn.set_int(&page, "views", -42)?;
    txn.set_bool(&page, "draft", true)?;
    txn.set_float(&page, "ratio", -1234.5625)?;
    txn.set_date(&page, "published", datetime!(2024-01-09 12:30:00.250 UTC))?;
    txn.set_node(&page, "author", &author)?;
    txn.set_opaque(&page, "thumb", vec![0, 255, 7])?;
    txn.commit()?;
    let id = page.read().id().to_owned();

    let check = |txn: &mut Transactor, page: &NodeRef| -> Result<()> {
        let guard = page.read();
        assert_eq!(guard.value("title"), Some(&Value::from("Typed")));
        assert_eq!(guard.value("views"), Some(&Value::Int(-42)));
        assert_eq!(guard.value("draft"), Some(&Value::Bool(true)));
        assert_eq!(guard.value("ratio"), Some(&Value::Float(-1234.5625)));
        assert_eq!(guard.value("published"), Some(&Value::Date(1_704_803_400_250)));
        assert_eq!(guard.value("thumb"), Some(&Value::Opaque(vec![0, 255, 7])));
        drop(guard);
        let author = txn.get_node_property(page, "author")?.expect("author resolves");
        assert_eq!(author.read().name(), Some("ada"));
        Ok(())
    };

    manager.evict_node(&page);
    let refetched = txn.get_node(&id, "Page")?.expect("stored page");
    assert!(!Arc::ptr_eq(&refetched, &page));
    check(&mut txn, &refetched)?;

    let mut reopened = Transactor::new(open(dir.path())?);
    let page = reopened.get_node(&id, "Page")?.expect("stored page");
    check(&mut reopened, &page)
}

#[test]
fn non_finite_floats_are_rejected_before_commit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = open(dir.path())?;
    let mut txn = Transactor::new(Arc::clone(&manager));
    txn.begin("scores");
    let root = txn.root()?;
    let page = txn.create_node("Page", Some("scores"));
    txn.add_node(&root, &page, None)?;
    txn.set_float(&page, "score", 1.5)?;
    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = txn.set_float(&page, "score", bad).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
        assert!(!err.is_retryable());
    }
    txn.commit()?;
    let id = page.read().id().to_owned();

    manager.evict_node(&page);
    let stored = txn.get_node(&id, "Page")?.expect("record stays readable");
    assert_eq!(stored.read().value("score"), Some(&Value::Float(1.5)));
    Ok(())
}
