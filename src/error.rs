use std::io;

use thiserror::Error;

use crate::key::Key;

/// Result alias used across the persistence core.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the node store.
///
/// A missing object is never an error: lookups return `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another live transaction holds pending changes to the node.
    #[error("concurrency conflict on {key}: write lock held by transaction {holder}")]
    Conflict {
        /// Key of the contended node.
        key: Key,
        /// Id of the transaction holding the lock.
        holder: u64,
    },
    /// The node was evicted behind the caller's back and must be re-fetched.
    #[error("node {0} is invalid and must be re-fetched")]
    InvalidNode(Key),
    /// The transaction was cancelled through its kill switch.
    #[error("transaction killed")]
    Killed,
    /// A value does not fit the relation declared for the property.
    #[error("type mismatch for property {property}: expected {expected}")]
    TypeMismatch {
        /// Property name.
        property: String,
        /// Human readable description of the accepted values.
        expected: &'static str,
    },
    /// Invalid or inconsistent type mapping.
    #[error("schema error: {0}")]
    Schema(String),
    /// Relational backend failure.
    #[error("SQL error: {0}")]
    Sql(String),
    /// SQLite driver failure.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// Embedded store I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Record (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// Configuration problem.
    #[error("config error: {0}")]
    Config(String),
    /// Configuration parse failure.
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    /// A mutation was attempted outside of an active transaction.
    #[error("no active transaction")]
    NoTransaction,
    /// API misuse.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl StoreError {
    /// Returns true when the caller may retry the whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::InvalidNode(_))
    }
}
