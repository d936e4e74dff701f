//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use session_relay_core::{
    Event, NewSession, SessionInfo, SessionUpdate, StorageError, StorageKind, StorageProvider,
    bump_timestamp,
};

use crate::{order_events, sort_sessions};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionInfo>,
    events: HashMap<String, Vec<Event>>,
}

/// In-memory storage implementation.
///
/// Useful for development and tests. Data is lost on restart.
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StorageError> {
        self.inner.read().map_err(StorageError::backend)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StorageError> {
        self.inner.write().map_err(StorageError::backend)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn create_session(&self, session: NewSession) -> Result<SessionInfo, StorageError> {
        let mut inner = self.write()?;
        if inner.sessions.contains_key(&session.id) {
            return Err(StorageError::DuplicateSession(session.id));
        }

        let info = session.into_info();
        inner.events.insert(info.id.clone(), Vec::new());
        inner.sessions.insert(info.id.clone(), info.clone());
        Ok(info)
    }

    async fn get_session_info(&self, id: &str) -> Result<Option<SessionInfo>, StorageError> {
        Ok(self.read()?.sessions.get(id).cloned())
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionInfo>, StorageError> {
        let mut result: Vec<SessionInfo> = self.read()?.sessions.values().cloned().collect();
        sort_sessions(&mut result);
        Ok(result)
    }

    async fn update_session_info(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionInfo, StorageError> {
        let mut inner = self.write()?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_owned()))?;

        session.apply(update);
        session.updated_at = bump_timestamp(session.updated_at);
        Ok(session.clone())
    }

    async fn delete_session(&self, id: &str) -> Result<bool, StorageError> {
        let mut inner = self.write()?;
        inner.events.remove(id);
        Ok(inner.sessions.remove(id).is_some())
    }

    async fn save_event(&self, id: &str, event: &Event) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_owned()))?;
        session.updated_at = bump_timestamp(session.updated_at);

        inner
            .events
            .entry(id.to_owned())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn get_session_events(&self, id: &str) -> Result<Vec<Event>, StorageError> {
        let mut events = self.read()?.events.get(id).cloned().unwrap_or_default();
        order_events(&mut events);
        Ok(events)
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let storage = MemoryStorage::new();
        storage
            .create_session(NewSession::with_id("s1", "/ws"))
            .await
            .unwrap();
        let err = storage
            .create_session(NewSession::with_id("s1", "/other"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateSession(id) if id == "s1"));

        let info = storage.get_session_info("s1").await.unwrap().unwrap();
        assert_eq!(info.workspace, "/ws");
    }

    #[tokio::test]
    async fn test_events_ordered_by_timestamp_then_insertion() {
        let storage = MemoryStorage::new();
        storage
            .create_session(NewSession::with_id("s1", "/ws"))
            .await
            .unwrap();

        storage.save_event("s1", &Event::user_message("b").at(20)).await.unwrap();
        storage.save_event("s1", &Event::user_message("a").at(10)).await.unwrap();
        storage.save_event("s1", &Event::user_message("c").at(20)).await.unwrap();

        let contents: Vec<_> = storage
            .get_session_events("s1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.content().unwrap().to_owned())
            .collect();
        assert_eq!(contents, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unknown_session_has_empty_log() {
        let storage = MemoryStorage::new();
        assert!(storage.get_session_events("nope").await.unwrap().is_empty());
        assert!(!storage.delete_session("nope").await.unwrap());
    }
}
