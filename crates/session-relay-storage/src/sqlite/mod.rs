//! SQLite session storage (feature-gated).
//!
//! Layout:
//! ```text
//! sessions(id PK, createdAt, updatedAt, workspace, metadata JSON)
//! events(id PK AUTOINCREMENT, sessionId FK -> sessions.id ON DELETE CASCADE,
//!        timestamp, eventData JSON)
//! ```
//! The pool holds a single connection, so statements from every session are
//! serialized through one handle. WAL journaling keeps readers unblocked.

mod migrate;

use std::{collections::HashMap, path::Path, str::FromStr};

use async_trait::async_trait;
use serde_json::Value;
use session_relay_core::{
    Event, NewSession, SessionInfo, SessionUpdate, StorageError, StorageKind, StorageProvider,
    bump_timestamp,
};
use sqlx::{
    Row,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
};
use tracing::{debug, warn};

pub use migrate::{MigrationOutcome, migrate};

use crate::decode_event;

fn db_err(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::Io(io) => StorageError::Io(io),
        other => StorageError::backend(other),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn session_from_row(row: &SqliteRow) -> Result<SessionInfo, StorageError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let metadata: Option<String> = row.try_get("metadata").map_err(db_err)?;
    let metadata = match metadata.as_deref().map(serde_json::from_str::<HashMap<String, Value>>) {
        Some(Ok(map)) => map,
        Some(Err(e)) => {
            warn!(session_id = %id, error = %e, "Unreadable session metadata, using empty map");
            HashMap::new()
        }
        None => HashMap::new(),
    };

    Ok(SessionInfo {
        created_at: row.try_get("createdAt").map_err(db_err)?,
        updated_at: row.try_get("updatedAt").map_err(db_err)?,
        workspace: row.try_get("workspace").map_err(db_err)?,
        metadata,
        id,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event, StorageError> {
    let timestamp: i64 = row.try_get("timestamp").map_err(db_err)?;
    let data: String = row.try_get("eventData").map_err(db_err)?;
    Ok(match serde_json::from_str::<Value>(&data) {
        Ok(value) => decode_event(value, timestamp),
        Err(e) => {
            warn!(error = %e, "Replacing unparsable stored event with placeholder");
            Event::corrupt_placeholder(timestamp, &e.to_string())
        }
    })
}

/// SQLite storage implementation.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) a database file.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or the database
    /// cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        debug!(path = %path.display(), "Opening SQLite session store");
        Self::connect(options).await
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns error if the connection cannot be established.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(db_err)?
            .foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StorageError> {
        // One connection for the process; it must never be recycled or an
        // in-memory database would vanish with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    /// Run schema detection / migration and report what happened.
    ///
    /// # Errors
    /// Returns `StorageError::Migration` if the database could not be
    /// brought to the current layout; nothing is changed in that case.
    pub async fn migrate(&self) -> Result<MigrationOutcome, StorageError> {
        migrate(&self.pool).await
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StorageProvider for SqliteStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Sqlite
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.migrate().await.map(|_| ())
    }

    async fn create_session(&self, session: NewSession) -> Result<SessionInfo, StorageError> {
        let info = session.into_info();
        let metadata = serde_json::to_string(&info.metadata)?;

        sqlx::query(
            "INSERT INTO sessions (id, createdAt, updatedAt, workspace, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&info.id)
        .bind(info.created_at)
        .bind(info.updated_at)
        .bind(&info.workspace)
        .bind(&metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::DuplicateSession(info.id.clone())
            } else {
                db_err(e)
            }
        })?;

        Ok(info)
    }

    async fn get_session_info(&self, id: &str) -> Result<Option<SessionInfo>, StorageError> {
        let row = sqlx::query(
            "SELECT id, createdAt, updatedAt, workspace, metadata FROM sessions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionInfo>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, createdAt, updatedAt, workspace, metadata FROM sessions \
             ORDER BY updatedAt DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(session_from_row).collect()
    }

    async fn update_session_info(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionInfo, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "SELECT id, createdAt, updatedAt, workspace, metadata FROM sessions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::NotFound(id.to_owned()))?;

        let mut info = session_from_row(&row)?;
        info.apply(update);
        info.updated_at = bump_timestamp(info.updated_at);
        let metadata = serde_json::to_string(&info.metadata)?;

        sqlx::query("UPDATE sessions SET workspace = ?1, metadata = ?2, updatedAt = ?3 WHERE id = ?4")
            .bind(&info.workspace)
            .bind(&metadata)
            .bind(info.updated_at)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(info)
    }

    async fn delete_session(&self, id: &str) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // The foreign key cascades too; deleting explicitly keeps the result
        // identical on databases opened without enforcement.
        sqlx::query("DELETE FROM events WHERE sessionId = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let deleted = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        tx.commit().await.map_err(db_err)?;
        Ok(deleted > 0)
    }

    async fn save_event(&self, id: &str, event: &Event) -> Result<(), StorageError> {
        let data = serde_json::to_string(event)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let touched = sqlx::query("UPDATE sessions SET updatedAt = MAX(?1, updatedAt + 1) WHERE id = ?2")
            .bind(bump_timestamp(0))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        if touched == 0 {
            // Dropping the transaction rolls it back.
            return Err(StorageError::NotFound(id.to_owned()));
        }

        sqlx::query("INSERT INTO events (sessionId, timestamp, eventData) VALUES (?1, ?2, ?3)")
            .bind(id)
            .bind(event.timestamp)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }

    async fn get_session_events(&self, id: &str) -> Result<Vec<Event>, StorageError> {
        let rows = sqlx::query(
            "SELECT timestamp, eventData FROM events WHERE sessionId = ?1 \
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}
