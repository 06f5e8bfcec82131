use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a cached object.
///
/// Keys are compared by value; two keys are equal only if they are of the
/// same kind and carry the same storage (or parent) and id (or name).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Key {
    /// A row in a table or a record in the embedded store.
    Db(DbKey),
    /// A derived object that has no row of its own.
    Synthetic(SyntheticKey),
}

/// Storage name plus primary key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbKey {
    /// Storage type name; `None` addresses the embedded store.
    pub storage: Option<String>,
    /// Primary key value.
    pub id: String,
}

/// Parent key plus discriminator name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyntheticKey {
    /// Key of the object this one is derived from.
    pub parent: Box<Key>,
    /// Name distinguishing this object among its siblings.
    pub name: String,
}

impl Key {
    /// Key of a record in the embedded store.
    pub fn embedded(id: impl Into<String>) -> Self {
        Key::Db(DbKey {
            storage: None,
            id: id.into(),
        })
    }

    /// Key of a row in the given storage.
    pub fn db(storage: Option<&str>, id: impl Into<String>) -> Self {
        Key::Db(DbKey {
            storage: storage.map(str::to_owned),
            id: id.into(),
        })
    }

    /// Key of an object derived from `parent` under `name`.
    pub fn synthetic(parent: &Key, name: impl Into<String>) -> Self {
        Key::Synthetic(SyntheticKey {
            parent: Box::new(parent.clone()),
            name: name.into(),
        })
    }

    /// Primary key (for db keys) or discriminator name (for synthetic keys).
    pub fn id(&self) -> &str {
        match self {
            Key::Db(k) => &k.id,
            Key::Synthetic(k) => &k.name,
        }
    }

    /// Storage name of a db key.
    pub fn storage(&self) -> Option<&str> {
        match self {
            Key::Db(k) => k.storage.as_deref(),
            Key::Synthetic(_) => None,
        }
    }

    /// Parent key of a synthetic key.
    pub fn parent(&self) -> Option<&Key> {
        match self {
            Key::Db(_) => None,
            Key::Synthetic(k) => Some(&k.parent),
        }
    }

    /// Whether this key addresses a derived object.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Key::Synthetic(_))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Db(k) => match &k.storage {
                Some(storage) => write!(f, "{storage}[{}]", k.id),
                None => write!(f, "[{}]", k.id),
            },
            Key::Synthetic(k) => write!(f, "{}/{}", k.parent, k.name),
        }
    }
}
