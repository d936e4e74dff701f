//! Session records and their metadata.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session identifier.
pub type SessionId = String;

/// Metadata key holding the display name.
pub const META_NAME: &str = "name";
/// Metadata key holding the tag list.
pub const META_TAGS: &str = "tags";
/// Metadata key holding the stored model choice.
pub const META_MODEL_CONFIG: &str = "modelConfig";
/// Metadata key holding the metadata layout version.
pub const META_VERSION: &str = "version";

/// Current metadata layout version written by this release.
pub const METADATA_VERSION: u64 = 1;

/// Current time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Next `updatedAt` value after `prev`.
///
/// Always strictly greater than `prev`, even when the clock has not
/// advanced (or went backwards) since the last mutation.
#[must_use]
pub fn bump_timestamp(prev: i64) -> i64 {
    now_ms().max(prev.saturating_add(1))
}

/// Model choice stored with a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Provider name (e.g. `anthropic`).
    pub provider: String,
    /// Provider-specific model id.
    pub model_id: String,
    /// When this choice was made (epoch ms).
    pub configured_at: i64,
}

impl ModelConfig {
    /// Create a model config stamped with the current time.
    #[must_use]
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            configured_at: now_ms(),
        }
    }
}

/// Persisted session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Unique session identifier. Immutable.
    pub id: SessionId,
    /// Absolute workspace path the session operates in.
    pub workspace: String,
    /// Creation timestamp (epoch ms).
    pub created_at: i64,
    /// Last mutation timestamp (epoch ms). Never below `created_at`.
    pub updated_at: i64,
    /// Open key-value metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl SessionInfo {
    /// Display name, if one was set.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.metadata.get(META_NAME).and_then(Value::as_str)
    }

    /// Tags attached to the session.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.metadata
            .get(META_TAGS)
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stored model choice. Malformed entries read as absent.
    #[must_use]
    pub fn model_config(&self) -> Option<ModelConfig> {
        self.metadata
            .get(META_MODEL_CONFIG)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Metadata layout version marker.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.metadata.get(META_VERSION).and_then(Value::as_u64)
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Replace the stored model choice.
    pub fn set_model_config(&mut self, config: &ModelConfig) {
        if let Ok(value) = serde_json::to_value(config) {
            self.metadata.insert(META_MODEL_CONFIG.to_owned(), value);
        }
    }

    /// Apply a partial update. Does not touch timestamps.
    pub fn apply(&mut self, update: SessionUpdate) {
        if let Some(workspace) = update.workspace {
            self.workspace = workspace;
        }
        if let Some(metadata) = update.metadata {
            self.metadata.extend(metadata);
        }
    }
}

/// Input to `StorageProvider::create_session`.
///
/// Timestamps left as `None` are assigned by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub id: SessionId,
    pub workspace: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl NewSession {
    /// Create a new session description with a fresh id.
    #[must_use]
    pub fn new(workspace: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), workspace)
    }

    /// Create a new session description with an explicit id.
    #[must_use]
    pub fn with_id(id: impl Into<SessionId>, workspace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workspace: workspace.into(),
            ..Self::default()
        }
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Resolve defaults into a full record.
    ///
    /// `updated_at` is clamped so it never precedes `created_at`.
    #[must_use]
    pub fn into_info(self) -> SessionInfo {
        let now = now_ms();
        let created_at = self.created_at.unwrap_or(now);
        let updated_at = self.updated_at.unwrap_or(created_at).max(created_at);
        SessionInfo {
            id: self.id,
            workspace: self.workspace,
            created_at,
            updated_at,
            metadata: self.metadata,
        }
    }
}

/// Partial update for `StorageProvider::update_session_info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    /// New workspace path.
    #[serde(default)]
    pub workspace: Option<String>,
    /// Metadata keys to merge over the existing map.
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

impl SessionUpdate {
    /// Update that only changes the workspace.
    #[must_use]
    pub fn workspace(workspace: impl Into<String>) -> Self {
        Self {
            workspace: Some(workspace.into()),
            metadata: None,
        }
    }

    /// Update that merges a single metadata key.
    #[must_use]
    pub fn metadata_entry(key: impl Into<String>, value: Value) -> Self {
        Self {
            workspace: None,
            metadata: Some(HashMap::from([(key.into(), value)])),
        }
    }

    /// Update that stores a new model choice.
    #[must_use]
    pub fn model_config(config: &ModelConfig) -> Self {
        Self::metadata_entry(
            META_MODEL_CONFIG,
            serde_json::to_value(config).unwrap_or(Value::Null),
        )
    }
}
