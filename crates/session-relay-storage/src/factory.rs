//! Configuration-keyed provider construction.

use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use session_relay_core::{StorageError, StorageProvider};
use tracing::info;

/// Which backend to use, keyed on `type` in configuration files.
///
/// ```json
/// { "type": "sqlite", "path": "/var/lib/relay/sessions.db" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
    #[serde(alias = "embedded-relational")]
    Sqlite {
        /// Database file; `:memory:` opens a private in-memory database.
        path: PathBuf,
    },
    #[serde(alias = "remote-document")]
    Mongodb {
        uri: String,
        #[serde(default = "default_database")]
        database: String,
    },
}

fn default_database() -> String {
    "session_relay".to_owned()
}

impl StorageConfig {
    /// Discriminator as written in configuration.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File { .. } => "file",
            Self::Sqlite { .. } => "sqlite",
            Self::Mongodb { .. } => "mongodb",
        }
    }
}

async fn build(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>, StorageError> {
    match config {
        #[cfg(feature = "memory")]
        StorageConfig::Memory => Ok(Arc::new(crate::MemoryStorage::new())),

        #[cfg(feature = "file")]
        StorageConfig::File { path } => Ok(Arc::new(crate::FileStorage::new(path.clone()))),

        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            let storage = if path.as_os_str() == ":memory:" {
                crate::SqliteStorage::in_memory().await?
            } else {
                crate::SqliteStorage::open(path).await?
            };
            Ok(Arc::new(storage))
        }

        #[cfg(feature = "mongodb")]
        StorageConfig::Mongodb { uri, database } => {
            Ok(Arc::new(crate::MongoStorage::connect(uri, database).await?))
        }

        #[allow(unreachable_patterns)]
        other => Err(StorageError::Backend(format!(
            "storage backend '{}' is not compiled in",
            other.type_name()
        ))),
    }
}

/// Build and initialize the provider described by `config`.
///
/// # Errors
/// Returns error if the backend is not compiled in, cannot be reached, or
/// fails to initialize (including a failed schema migration).
pub async fn create_storage_provider(
    config: &StorageConfig,
) -> Result<Arc<dyn StorageProvider>, StorageError> {
    let provider = build(config).await?;
    provider.initialize().await?;
    info!(backend = %provider.kind(), "Storage provider ready");
    Ok(provider)
}
