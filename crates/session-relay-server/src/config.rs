//! Server configuration.

use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use session_relay_core::ModelRef;
use session_relay_storage::StorageConfig;
use thiserror::Error;

use crate::policy::{PersistPolicy, SkipKinds, SkipStreaming};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a [`SessionRegistry`](crate::SessionRegistry) needs to start.
///
/// ```json
/// {
///   "storage": { "type": "sqlite", "path": "sessions.db" },
///   "exclusive": true,
///   "defaultModel": { "provider": "openai", "modelId": "gpt-4o" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub storage: StorageConfig,
    /// Allow at most one running session per process.
    pub exclusive: bool,
    pub default_model: ModelRef,
    /// Models sessions may select; empty accepts any.
    pub available_models: Vec<ModelRef>,
    /// Event kinds kept out of durable storage. `None` skips streaming deltas.
    pub non_persisted_kinds: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            exclusive: false,
            default_model: ModelRef::new("openai", "gpt-4o"),
            available_models: Vec::new(),
            non_persisted_kinds: None,
        }
    }
}

impl ServerConfig {
    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or fails validation.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// Returns error if the default model is empty or not in a non-empty
    /// `available_models` list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_model.provider.is_empty() || self.default_model.model_id.is_empty() {
            return Err(ConfigError::Invalid("defaultModel must name a provider and model".into()));
        }
        if !self.available_models.is_empty() && !self.available_models.contains(&self.default_model) {
            return Err(ConfigError::Invalid(format!(
                "defaultModel {}/{} is not listed in availableModels",
                self.default_model.provider, self.default_model.model_id
            )));
        }
        Ok(())
    }

    /// Persistence filter implied by `non_persisted_kinds`.
    #[must_use]
    pub fn persist_policy(&self) -> Arc<dyn PersistPolicy> {
        match &self.non_persisted_kinds {
            Some(kinds) => Arc::new(SkipKinds::new(kinds.iter().map(String::as_str))),
            None => Arc::new(SkipStreaming),
        }
    }
}
