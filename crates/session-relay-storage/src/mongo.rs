//! MongoDB session storage (feature-gated).
//!
//! Collections:
//! - `sessions`: one document per session, `_id` = session id
//! - `events`: `{ sessionId, timestamp, event }`, compound index on
//!   `(sessionId, timestamp)`
//!
//! Duplicate creates are detected from the server's duplicate-key error
//! instead of a separate existence check. There are no multi-document
//! transactions. A session is deleted before its events, and `save_event`
//! checks the session again after inserting; if it vanished in between the
//! event is removed and the call fails with `NotFound`. Either the delete's
//! event sweep or that check catches every racing write.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    Client, Collection, IndexModel,
    bson::{self, Bson, Document, doc},
    error::{ErrorKind, WriteFailure},
    options::ReturnDocument,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use session_relay_core::{
    Event, NewSession, SessionInfo, SessionUpdate, StorageError, StorageKind, StorageProvider,
    bump_timestamp,
};
use tracing::{debug, warn};

use crate::decode_event;

const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDoc {
    #[serde(rename = "_id")]
    id: String,
    created_at: i64,
    updated_at: i64,
    workspace: String,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

impl From<SessionInfo> for SessionDoc {
    fn from(info: SessionInfo) -> Self {
        Self {
            id: info.id,
            created_at: info.created_at,
            updated_at: info.updated_at,
            workspace: info.workspace,
            metadata: info.metadata,
        }
    }
}

impl From<SessionDoc> for SessionInfo {
    fn from(doc: SessionDoc) -> Self {
        Self {
            id: doc.id,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            workspace: doc.workspace,
            metadata: doc.metadata,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventDoc {
    session_id: String,
    timestamp: i64,
    event: Value,
}

/// `updatedAt` moves to `now`, or one past its stored value if that is later.
fn bump_updated_at(now: i64) -> Document {
    doc! { "$max": [now, { "$add": ["$updatedAt", 1] }] }
}

/// Single-stage pipeline applying `update` on the server.
///
/// Values are wrapped in `$literal` so strings starting with `$` are not
/// read as field paths.
fn session_update_pipeline(update: &SessionUpdate, now: i64) -> Result<Vec<Document>, StorageError> {
    let mut set = doc! { "updatedAt": bump_updated_at(now) };
    if let Some(workspace) = &update.workspace {
        set.insert("workspace", doc! { "$literal": workspace });
    }
    if let Some(metadata) = &update.metadata {
        let patch: Bson = bson::to_bson(metadata).map_err(StorageError::backend)?;
        set.insert(
            "metadata",
            doc! { "$mergeObjects": [{ "$ifNull": ["$metadata", {}] }, { "$literal": patch }] },
        );
    }
    Ok(vec![doc! { "$set": set }])
}

fn mongo_err(e: mongodb::error::Error) -> StorageError {
    StorageError::backend(e)
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(w)) if w.code == DUPLICATE_KEY
    )
}

/// MongoDB storage implementation.
pub struct MongoStorage {
    client: Client,
    sessions: Collection<SessionDoc>,
    events: Collection<Document>,
}

impl MongoStorage {
    /// Connect to `uri` and use `database`.
    ///
    /// # Errors
    /// Returns error if the connection string is invalid.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StorageError> {
        let client = Client::with_uri_str(uri).await.map_err(mongo_err)?;
        let db = client.database(database);
        debug!(database, "Connected to MongoDB session store");
        Ok(Self {
            sessions: db.collection("sessions"),
            events: db.collection("events"),
            client,
        })
    }
}

#[async_trait]
impl StorageProvider for MongoStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Mongodb
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        // Creating an identical index twice is a no-op on the server.
        self.events
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "sessionId": 1, "timestamp": 1 })
                    .build(),
            )
            .await
            .map_err(mongo_err)?;
        self.sessions
            .create_index(IndexModel::builder().keys(doc! { "updatedAt": -1 }).build())
            .await
            .map_err(mongo_err)?;
        Ok(())
    }

    async fn create_session(&self, session: NewSession) -> Result<SessionInfo, StorageError> {
        let info = session.into_info();
        let doc = SessionDoc::from(info.clone());

        self.sessions.insert_one(&doc).await.map_err(|e| {
            if is_duplicate_key(&e) {
                StorageError::DuplicateSession(info.id.clone())
            } else {
                mongo_err(e)
            }
        })?;
        Ok(info)
    }

    async fn get_session_info(&self, id: &str) -> Result<Option<SessionInfo>, StorageError> {
        let doc = self
            .sessions
            .find_one(doc! { "_id": id })
            .await
            .map_err(mongo_err)?;
        Ok(doc.map(SessionInfo::from))
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionInfo>, StorageError> {
        let docs: Vec<SessionDoc> = self
            .sessions
            .find(doc! {})
            .sort(doc! { "updatedAt": -1 })
            .await
            .map_err(mongo_err)?
            .try_collect()
            .await
            .map_err(mongo_err)?;
        Ok(docs.into_iter().map(SessionInfo::from).collect())
    }

    async fn update_session_info(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionInfo, StorageError> {
        let pipeline = session_update_pipeline(&update, bump_timestamp(0))?;
        self.sessions
            .find_one_and_update(doc! { "_id": id }, pipeline)
            .return_document(ReturnDocument::After)
            .await
            .map_err(mongo_err)?
            .map(SessionInfo::from)
            .ok_or_else(|| StorageError::NotFound(id.to_owned()))
    }

    async fn delete_session(&self, id: &str) -> Result<bool, StorageError> {
        let deleted = self
            .sessions
            .delete_one(doc! { "_id": id })
            .await
            .map_err(mongo_err)?
            .deleted_count;
        self.events
            .delete_many(doc! { "sessionId": id })
            .await
            .map_err(mongo_err)?;
        Ok(deleted > 0)
    }

    async fn save_event(&self, id: &str, event: &Event) -> Result<(), StorageError> {
        let now = bump_timestamp(0);
        let touched = self
            .sessions
            .update_one(
                doc! { "_id": id },
                vec![doc! { "$set": { "updatedAt": bump_updated_at(now) } }],
            )
            .await
            .map_err(mongo_err)?;
        if touched.matched_count == 0 {
            return Err(StorageError::NotFound(id.to_owned()));
        }

        let doc = bson::to_document(&EventDoc {
            session_id: id.to_owned(),
            timestamp: event.timestamp,
            event: serde_json::to_value(event)?,
        })
        .map_err(StorageError::backend)?;
        let inserted = self.events.insert_one(doc).await.map_err(mongo_err)?.inserted_id;

        // A delete that removed the session before this insert landed has
        // already swept its events; take this one back out.
        let still_there = self
            .sessions
            .count_documents(doc! { "_id": id })
            .limit(1)
            .await
            .map_err(mongo_err)?;
        if still_there == 0 {
            self.events
                .delete_one(doc! { "_id": inserted })
                .await
                .map_err(mongo_err)?;
            warn!(session_id = id, "Session deleted while saving an event; event discarded");
            return Err(StorageError::NotFound(id.to_owned()));
        }
        Ok(())
    }

    async fn get_session_events(&self, id: &str) -> Result<Vec<Event>, StorageError> {
        let docs: Vec<Document> = self
            .events
            .find(doc! { "sessionId": id })
            .sort(doc! { "timestamp": 1, "_id": 1 })
            .await
            .map_err(mongo_err)?
            .try_collect()
            .await
            .map_err(mongo_err)?;

        Ok(docs
            .into_iter()
            .map(|doc| match bson::from_document::<EventDoc>(doc) {
                Ok(stored) => decode_event(stored.event, stored.timestamp),
                Err(e) => {
                    warn!(session_id = id, error = %e, "Unreadable event document");
                    Event::corrupt_placeholder(0, &e.to_string())
                }
            })
            .collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}
