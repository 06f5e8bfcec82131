use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StoreError};

/// Connection settings of one relational data source.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSourceConfig {
    /// Database location; for SQLite a file path, optionally `sqlite:` prefixed.
    pub url: String,
}

/// Settings used when opening a [`crate::NodeManager`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Maximum number of nodes kept in the shared cache.
    pub cache_capacity: usize,
    /// Directory of the embedded file store; in-memory when unset.
    pub embedded_path: Option<PathBuf>,
    /// Relational data sources keyed by the name types refer to.
    pub data_sources: BTreeMap<String, DataSourceConfig>,
    /// How long a kill waits for the transaction to stop on its own.
    pub kill_grace_ms: u64,
    /// Commits slower than this are logged as warnings.
    pub slow_txn_warn_ms: u64,
    /// Ids fetched per round trip for segmented child lists.
    pub segment_size: usize,
    /// TOML file holding the type mappings.
    pub schema: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            embedded_path: None,
            data_sources: BTreeMap::new(),
            kill_grace_ms: 1_000,
            slow_txn_warn_ms: 5_000,
            segment_size: 1_000,
            schema: None,
        }
    }
}

impl StoreConfig {
    /// Default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            StoreError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Sets the cache capacity.
    pub fn cache_capacity(mut self, nodes: usize) -> Self {
        self.cache_capacity = nodes;
        self
    }

    /// Keeps embedded nodes in files under `dir`.
    pub fn embedded_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.embedded_path = Some(dir.into());
        self
    }

    /// Registers a relational data source.
    pub fn data_source(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.data_sources
            .insert(name.into(), DataSourceConfig { url: url.into() });
        self
    }

    /// Sets the kill grace period in milliseconds.
    pub fn kill_grace_ms(mut self, ms: u64) -> Self {
        self.kill_grace_ms = ms;
        self
    }

    /// Sets the slow commit threshold in milliseconds.
    pub fn slow_txn_warn_ms(mut self, ms: u64) -> Self {
        self.slow_txn_warn_ms = ms;
        self
    }

    /// Sets the segment size of segmented child lists.
    pub fn segment_size(mut self, ids: usize) -> Self {
        self.segment_size = ids;
        self
    }

    /// Loads type mappings from `path`.
    pub fn schema(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema = Some(path.into());
        self
    }

    /// Kill grace period.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Slow commit threshold.
    pub fn slow_txn_warn(&self) -> Duration {
        Duration::from_millis(self.slow_txn_warn_ms)
    }

    /// Rejects settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(StoreError::Config("cache_capacity must be positive".into()));
        }
        if self.segment_size == 0 {
            return Err(StoreError::Config("segment_size must be positive".into()));
        }
        if let Some((name, _)) = self.data_sources.iter().find(|(_, ds)| ds.url.trim().is_empty()) {
            return Err(StoreError::Config(format!("data source {name} has an empty url")));
        }
        Ok(())
    }
}
