pub mod config;
pub mod error;

pub use config::{CacheConfig, Config, GitHubConfig, SyncConfig, ValidationResult};
pub use error::{
    AppError, ConfigError, DatabaseError, RemoteError, ReqwestErrorExt, RusqliteErrorExt,
    SyncError,
};

use anyhow::Result;

/// Initialize logging.
///
/// `RUST_LOG` wins over `default_filter` when both are present.
pub fn init(default_filter: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!("Repowatch core initialized");
    Ok(())
}
