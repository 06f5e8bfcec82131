//! hopdb: the persistence core of an object publishing server.
//!
//! Objects ([`Node`]s) live either in an embedded record store or in
//! relational tables described by a TOML schema ([`MappingRegistry`]). A
//! process-wide [`NodeManager`] owns the shared object cache and talks to the
//! backends; each worker thread drives its reads and writes through its own
//! [`Transactor`].

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod handle;
pub mod idgen;
pub mod key;
pub mod locks;
pub mod logging;
pub mod manager;
pub mod mapping;
pub mod metrics;
pub mod node;
pub mod resolve;
pub mod store;
pub mod subnodes;
pub mod transactor;
pub mod value;

pub use cache::NodeCache;
pub use config::{DataSourceConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use handle::NodeHandle;
pub use key::{DbKey, Key, SyntheticKey};
pub use locks::{LockOwner, LockTable};
pub use logging::init_logging;
pub use manager::{NodeChangeListener, NodeManager, ROOT_ID, USER_ROOT_ID};
pub use mapping::{DbMapping, MappingRegistry, Relation, RelationKind};
pub use metrics::{CounterMetrics, NoopMetrics, StoreMetrics};
pub use node::{Node, NodeRef, NodeState};
pub use store::{EmbeddedStore, FileStore, MemoryStore};
pub use subnodes::{OrderSpec, Subnodes};
pub use transactor::{KillSwitch, Transactor};
pub use value::{Property, Value, ValueKind};
