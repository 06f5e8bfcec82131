use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, StoreError};

/// Installs a `fmt` subscriber filtered by `level` (an `EnvFilter` directive
/// such as `"info"` or `"hopdb=debug"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| StoreError::Config(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StoreError::Config("logging already initialized".into()))
}
