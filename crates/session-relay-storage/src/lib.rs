//! Storage providers for durable agent sessions.
//!
//! Provides:
//! - `MemoryStorage` - Volatile, for development and tests
//! - `FileStorage` - Single JSON document
//! - `SqliteStorage` - Embedded SQLite with schema migration (feature: sqlite)
//! - `MongoStorage` - Remote MongoDB (feature: mongodb)
//! - `StorageConfig` / `create_storage_provider` - Configuration-keyed factory

pub mod factory;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mongodb")]
pub mod mongo;

pub use factory::{StorageConfig, create_storage_provider};

#[cfg(feature = "memory")]
pub use memory::MemoryStorage;

#[cfg(feature = "file")]
pub use file::FileStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

#[cfg(feature = "mongodb")]
pub use mongo::MongoStorage;

#[cfg(any(feature = "memory", feature = "file", feature = "sqlite", feature = "mongodb"))]
use session_relay_core::Event;
#[cfg(any(feature = "memory", feature = "file"))]
use session_relay_core::SessionInfo;

/// Most recently updated first.
#[cfg(any(feature = "memory", feature = "file"))]
pub(crate) fn sort_sessions(sessions: &mut [SessionInfo]) {
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// Timestamp order; stable, so insertion order breaks ties.
#[cfg(any(feature = "memory", feature = "file"))]
pub(crate) fn order_events(events: &mut [Event]) {
    events.sort_by_key(|e| e.timestamp);
}

/// Decode a stored event, substituting a placeholder when it is unreadable.
#[cfg(any(feature = "file", feature = "sqlite", feature = "mongodb"))]
pub(crate) fn decode_event(raw: serde_json::Value, fallback_timestamp: i64) -> Event {
    serde_json::from_value(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Replacing unreadable stored event with placeholder");
        Event::corrupt_placeholder(fallback_timestamp, &e.to_string())
    })
}
