//! Storage provider contract.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Event, NewSession, SessionInfo, SessionUpdate};

/// Which backend a provider instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Volatile, process-local.
    Memory,
    /// Single JSON document on disk.
    File,
    /// Embedded SQLite database.
    Sqlite,
    /// Remote MongoDB deployment.
    Mongodb,
}

impl StorageKind {
    /// Whether data survives a process restart.
    #[must_use]
    pub const fn is_durable(self) -> bool {
        !matches!(self, Self::Memory)
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Sqlite => "sqlite",
            Self::Mongodb => "mongodb",
        })
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already exists: {0}")]
    DuplicateSession(String),
    #[error("Schema migration failed: {0}")]
    Migration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Create a backend error from any displayable failure.
    pub fn backend(e: impl fmt::Display) -> Self {
        Self::Backend(e.to_string())
    }

    /// Whether retrying later may succeed.
    ///
    /// Read paths that only feed browsing views may degrade on these.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Backend(_))
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::DuplicateSession(_) => "DUPLICATE_SESSION",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Io(_) | Self::Backend(_) => "STORAGE_UNAVAILABLE",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Durable CRUD for sessions and their append-only event logs.
///
/// `initialize` must complete before any other method is used, and may be
/// called more than once. Methods after `close` are unspecified.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> StorageKind;

    /// Prepare schema / files. Idempotent.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Persist a new session.
    ///
    /// Fails with `DuplicateSession` if the id is taken.
    async fn create_session(&self, session: NewSession) -> Result<SessionInfo, StorageError>;

    /// Get a session by id. Absent sessions are `Ok(None)`.
    async fn get_session_info(&self, id: &str) -> Result<Option<SessionInfo>, StorageError>;

    /// All sessions, most recently updated first.
    async fn get_all_sessions(&self) -> Result<Vec<SessionInfo>, StorageError>;

    /// Merge `update` into a session and bump `updated_at`.
    async fn update_session_info(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionInfo, StorageError>;

    /// Delete a session and its events. `Ok(false)` if it did not exist.
    async fn delete_session(&self, id: &str) -> Result<bool, StorageError>;

    /// Append an event and bump the session's `updated_at`.
    ///
    /// Fails with `NotFound` (writing nothing) if the session is absent.
    async fn save_event(&self, id: &str, event: &Event) -> Result<(), StorageError>;

    /// The full event log in append order.
    ///
    /// Undecodable stored events come back as error placeholders.
    async fn get_session_events(&self, id: &str) -> Result<Vec<Event>, StorageError>;

    /// Flush and release resources.
    async fn close(&self) -> Result<(), StorageError>;
}
