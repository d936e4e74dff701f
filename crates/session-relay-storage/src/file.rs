//! Single-file JSON document storage.
//!
//! The whole store is one document:
//! ```text
//! {
//!   "sessions": { "<id>": SessionInfo, ... },
//!   "events":   { "<id>": [Event, ...], ... }
//! }
//! ```
//! Every mutation reads the document, applies the change and rewrites it
//! through a temp file + rename. Mutations are serialized within this
//! process only; other processes writing the same file will race.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use session_relay_core::{
    Event, NewSession, SessionInfo, SessionUpdate, StorageError, StorageKind, StorageProvider,
    bump_timestamp,
};
use tokio::{fs, sync::Mutex};
use tracing::debug;

use crate::{decode_event, order_events, sort_sessions};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    sessions: BTreeMap<String, SessionInfo>,
    // Kept as raw values so one bad entry does not poison the whole file.
    #[serde(default)]
    events: BTreeMap<String, Vec<Value>>,
}

/// File-backed storage implementation.
pub struct FileStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Create a file storage at `path`. Nothing is touched until `initialize`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Document, StorageError> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Document::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, doc: &Document) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for FileStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::File
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        if fs::try_exists(&self.path).await? {
            // Validate early so a corrupt file fails startup, not the first request.
            self.load().await?;
        } else {
            self.store(&Document::default()).await?;
            debug!(path = %self.path.display(), "Created session document");
        }
        Ok(())
    }

    async fn create_session(&self, session: NewSession) -> Result<SessionInfo, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        if doc.sessions.contains_key(&session.id) {
            return Err(StorageError::DuplicateSession(session.id));
        }

        let info = session.into_info();
        doc.events.insert(info.id.clone(), Vec::new());
        doc.sessions.insert(info.id.clone(), info.clone());
        self.store(&doc).await?;
        Ok(info)
    }

    async fn get_session_info(&self, id: &str) -> Result<Option<SessionInfo>, StorageError> {
        Ok(self.load().await?.sessions.remove(id))
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionInfo>, StorageError> {
        let mut sessions: Vec<SessionInfo> = self.load().await?.sessions.into_values().collect();
        sort_sessions(&mut sessions);
        Ok(sessions)
    }

    async fn update_session_info(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionInfo, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        let session = doc
            .sessions
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_owned()))?;

        session.apply(update);
        session.updated_at = bump_timestamp(session.updated_at);
        let info = session.clone();
        self.store(&doc).await?;
        Ok(info)
    }

    async fn delete_session(&self, id: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        let existed = doc.sessions.remove(id).is_some();
        let had_events = doc.events.remove(id).is_some();
        if existed || had_events {
            self.store(&doc).await?;
        }
        Ok(existed)
    }

    async fn save_event(&self, id: &str, event: &Event) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        let session = doc
            .sessions
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_owned()))?;
        session.updated_at = bump_timestamp(session.updated_at);

        let value = serde_json::to_value(event)?;
        doc.events.entry(id.to_owned()).or_default().push(value);
        self.store(&doc).await
    }

    async fn get_session_events(&self, id: &str) -> Result<Vec<Event>, StorageError> {
        let raw = self.load().await?.events.remove(id).unwrap_or_default();
        let mut events: Vec<Event> = raw
            .into_iter()
            .map(|value| {
                let ts = value.get("timestamp").and_then(Value::as_i64).unwrap_or(0);
                decode_event(value, ts)
            })
            .collect();
        order_events(&mut events);
        Ok(events)
    }

    async fn close(&self) -> Result<(), StorageError> {
        // Every mutation is already on disk; wait out an in-flight one.
        let _guard = self.write_lock.lock().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_document_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.json");
        let storage = FileStorage::new(&path);
        storage.initialize().await.unwrap();
        storage
            .create_session(NewSession::with_id("s1", "/ws"))
            .await
            .unwrap();
        storage.save_event("s1", &Event::user_message("hi")).await.unwrap();

        let doc: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["sessions"]["s1"]["workspace"], "/ws");
        assert_eq!(doc["events"]["s1"][0]["type"], "user_message");
        assert_eq!(doc["events"]["s1"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let storage = FileStorage::new(&path);
            storage.initialize().await.unwrap();
            storage
                .create_session(NewSession::with_id("s1", "/ws"))
                .await
                .unwrap();
            storage.save_event("s1", &Event::assistant_message("ok")).await.unwrap();
            storage.close().await.unwrap();
        }

        let reopened = FileStorage::new(&path);
        reopened.initialize().await.unwrap();
        let events = reopened.get_session_events("s1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content(), Some("ok"));
    }

    #[tokio::test]
    async fn test_corrupt_event_becomes_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let doc = json!({
            "sessions": {
                "s1": { "id": "s1", "workspace": "/ws", "createdAt": 1, "updatedAt": 2, "metadata": {} }
            },
            "events": {
                "s1": [
                    { "type": "user_message", "timestamp": 1, "content": "hi" },
                    { "timestamp": 2, "no_type": true },
                    { "type": "assistant_message", "timestamp": 3, "content": "hello" }
                ]
            }
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let storage = FileStorage::new(&path);
        storage.initialize().await.unwrap();
        let events = storage.get_session_events("s1").await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[1].is_error());
        assert_eq!(events[1].timestamp, 2);
        assert_eq!(events[2].content(), Some("hello"));
    }

    #[tokio::test]
    async fn test_initialize_keeps_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("s.json"));
        storage.initialize().await.unwrap();
        storage
            .create_session(NewSession::with_id("s1", "/ws"))
            .await
            .unwrap();
        storage.initialize().await.unwrap();
        assert_eq!(storage.get_all_sessions().await.unwrap().len(), 1);
    }
}
