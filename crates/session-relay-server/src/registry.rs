//! Session registry owning every live agent session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::stream::BoxStream;
use serde_json::Value;
use session_relay_core::{
    AgentError, Event, ModelConfig, ModelRef, NewSession, SessionId, SessionInfo, SessionUpdate,
    StorageError, StorageProvider,
    session::{META_VERSION, METADATA_VERSION},
};
use session_relay_storage::create_storage_provider;
use session_relay_transport::EventStreamBridge;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    agent_session::{AgentSession, QueryResult, SessionServices},
    config::ServerConfig,
    guard::ExclusiveGuard,
    model::{AgentFactory, ModelResolver},
    telemetry::TelemetrySink,
};

/// Registry error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Server is busy running session {0}")]
    Busy(SessionId),
    #[error("Unknown model: {provider}/{model_id}")]
    UnknownModel { provider: String, model_id: String },
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other),
        }
    }
}

impl SessionError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "SESSION_NOT_FOUND",
            Self::Busy(_) => "SESSION_BUSY",
            Self::UnknownModel { .. } => "UNKNOWN_MODEL",
            Self::Agent(_) => "AGENT_NOT_READY",
            Self::Storage(e) => e.code(),
        }
    }
}

type Slot = Arc<OnceCell<Arc<AgentSession>>>;

/// Owns the storage provider, the exclusive guard and every active
/// session. One per server; dropped or [`shutdown`](Self::shutdown) with it.
pub struct SessionRegistry {
    storage: Arc<dyn StorageProvider>,
    guard: Arc<ExclusiveGuard>,
    resolver: ModelResolver,
    factory: Arc<dyn AgentFactory>,
    services: SessionServices,
    // A slot is inserted before restoring so concurrent lookups of the
    // same id await one restore.
    active: Mutex<HashMap<SessionId, Slot>>,
}

impl SessionRegistry {
    /// Create a registry over an initialized storage provider.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        config: &ServerConfig,
        factory: Arc<dyn AgentFactory>,
        telemetry: Option<Arc<dyn TelemetrySink>>,
    ) -> Self {
        let guard = Arc::new(ExclusiveGuard::new(config.exclusive));
        let services = SessionServices {
            storage: Arc::clone(&storage),
            guard: Arc::clone(&guard),
            policy: config.persist_policy(),
            telemetry,
        };
        Self {
            storage,
            guard,
            resolver: ModelResolver::new(
                config.default_model.clone(),
                config.available_models.clone(),
            ),
            factory,
            services,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Build storage from `config` and create a registry over it.
    ///
    /// # Errors
    /// Returns error if the storage provider cannot be created or fails
    /// to initialize (including a failed migration).
    pub async fn from_config(
        config: &ServerConfig,
        factory: Arc<dyn AgentFactory>,
        telemetry: Option<Arc<dyn TelemetrySink>>,
    ) -> Result<Self, SessionError> {
        let storage = create_storage_provider(&config.storage).await?;
        info!(
            backend = %storage.kind(),
            durable = storage.kind().is_durable(),
            exclusive = config.exclusive,
            "Session registry starting"
        );
        Ok(Self::new(storage, config, factory, telemetry))
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SessionId, Slot>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    #[must_use]
    pub fn guard(&self) -> &Arc<ExclusiveGuard> {
        &self.guard
    }

    #[must_use]
    pub const fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    async fn activate(&self, info: &SessionInfo) -> Result<Arc<AgentSession>, SessionError> {
        let model = self.resolver.resolve_for(info);
        let agent = self.factory.create_agent(info, &model)?;
        let session = Arc::new(AgentSession::new(info, agent, model, self.services.clone()));
        session.initialize().await?;
        Ok(session)
    }

    async fn restore(&self, id: &str) -> Result<Arc<AgentSession>, SessionError> {
        let info = self
            .storage
            .get_session_info(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_owned()))?;
        debug!(session_id = id, "Restoring session from storage");
        self.activate(&info).await
    }

    fn forget_slot(&self, id: &str, slot: &Slot) {
        let mut slots = self.slots();
        if slots.get(id).is_some_and(|s| Arc::ptr_eq(s, slot)) && !slot.initialized() {
            slots.remove(id);
        }
    }

    /// Create, persist and activate a new session.
    ///
    /// # Errors
    /// Returns error if storage rejects the session or the agent fails to
    /// start. The stored record is kept in the latter case.
    pub async fn create_session(
        &self,
        workspace: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Result<Arc<AgentSession>, SessionError> {
        let mut new = NewSession::new(workspace);
        new.metadata = metadata;
        new.metadata
            .entry(META_VERSION.to_owned())
            .or_insert_with(|| Value::from(METADATA_VERSION));

        let info = self.storage.create_session(new).await?;
        let slot: Slot = Arc::new(OnceCell::new());
        self.slots().insert(info.id.clone(), Arc::clone(&slot));

        match slot.get_or_try_init(|| self.activate(&info)).await {
            Ok(session) => {
                info!(session_id = %info.id, workspace = %info.workspace, "Session created");
                Ok(Arc::clone(session))
            }
            Err(e) => {
                self.forget_slot(&info.id, &slot);
                Err(e)
            }
        }
    }

    /// The active session for `id`, restoring it from storage if needed.
    ///
    /// # Errors
    /// Returns `NotFound` if no such session is stored, or the agent error
    /// if it cannot be started.
    pub async fn get_or_restore(&self, id: &str) -> Result<Arc<AgentSession>, SessionError> {
        let slot = Arc::clone(self.slots().entry(id.to_owned()).or_default());
        match slot.get_or_try_init(|| self.restore(id)).await {
            Ok(session) => Ok(Arc::clone(session)),
            Err(e) => {
                self.forget_slot(id, &slot);
                Err(e)
            }
        }
    }

    /// The session for `id` if it is active; never restores.
    #[must_use]
    pub fn active_session(&self, id: &str) -> Option<Arc<AgentSession>> {
        self.slots().get(id).and_then(|slot| slot.get().cloned())
    }

    /// Ids of active sessions.
    #[must_use]
    pub fn active_ids(&self) -> Vec<SessionId> {
        self.slots()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Live bridge for `id`, restoring the session if needed.
    ///
    /// # Errors
    /// Same as [`get_or_restore`](Self::get_or_restore).
    pub async fn bridge(&self, id: &str) -> Result<Arc<EventStreamBridge>, SessionError> {
        Ok(Arc::clone(self.get_or_restore(id).await?.bridge()))
    }

    fn check_capacity(&self) -> Result<(), SessionError> {
        if self.guard.can_accept_new_request() {
            Ok(())
        } else {
            Err(SessionError::Busy(
                self.guard.running_session().unwrap_or_default(),
            ))
        }
    }

    /// Run a query to completion.
    ///
    /// # Errors
    /// Returns `Busy` in exclusive mode while another session runs, or a
    /// lookup error. Agent failures are reported inside the `QueryResult`.
    pub async fn run_query(&self, id: &str, input: &str) -> Result<QueryResult, SessionError> {
        self.check_capacity()?;
        let session = self.get_or_restore(id).await?;
        Ok(session.run_query(input).await)
    }

    /// Run a query, streaming its events.
    ///
    /// # Errors
    /// Same as [`run_query`](Self::run_query).
    pub async fn run_query_streaming(
        &self,
        id: &str,
        input: &str,
    ) -> Result<BoxStream<'static, Event>, SessionError> {
        self.check_capacity()?;
        let session = self.get_or_restore(id).await?;
        Ok(session.run_query_streaming(input))
    }

    /// Abort the running query of an active session.
    ///
    /// Returns false if the session is not active or nothing was running.
    pub async fn abort_query(&self, id: &str) -> bool {
        match self.active_session(id) {
            Some(session) => session.abort_query().await,
            None => false,
        }
    }

    /// Store a new model choice for future runs of `id`.
    ///
    /// # Errors
    /// Returns `UnknownModel` if the model is not offered, or a storage
    /// error (`NotFound` for unknown sessions).
    pub async fn update_model_config(
        &self,
        id: &str,
        model: ModelRef,
    ) -> Result<SessionInfo, SessionError> {
        if !self.resolver.is_available(&model) {
            return Err(SessionError::UnknownModel {
                provider: model.provider,
                model_id: model.model_id,
            });
        }

        if let Some(session) = self.active_session(id) {
            return Ok(session.update_model_config(model).await?);
        }
        let config = ModelConfig::new(model.provider, model.model_id);
        Ok(self
            .storage
            .update_session_info(id, SessionUpdate::model_config(&config))
            .await?)
    }

    /// All stored sessions, most recently updated first.
    ///
    /// # Errors
    /// Returns error if storage cannot be read.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, SessionError> {
        Ok(self.storage.get_all_sessions().await?)
    }

    /// Stored record for `id`.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub async fn session_info(&self, id: &str) -> Result<SessionInfo, SessionError> {
        self.storage
            .get_session_info(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_owned()))
    }

    /// Durable event log for `id`.
    ///
    /// Transient storage failures yield an empty log so history views
    /// stay usable.
    ///
    /// # Errors
    /// Returns error for non-transient storage failures.
    pub async fn session_events(&self, id: &str) -> Result<Vec<Event>, SessionError> {
        match self.storage.get_session_events(id).await {
            Ok(events) => Ok(events),
            Err(e) if e.is_transient() => {
                warn!(session_id = id, error = %e, "Event history unavailable, returning empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deactivate `id`, keeping its durable data.
    ///
    /// Returns whether the session was active.
    pub async fn cleanup_session(&self, id: &str) -> bool {
        let slot = self.slots().remove(id);
        match slot.and_then(|slot| slot.get().cloned()) {
            Some(session) => {
                session.cleanup().await;
                true
            }
            None => false,
        }
    }

    /// Deactivate `id` and delete it with all its events.
    ///
    /// # Errors
    /// Returns error if storage fails to delete.
    pub async fn delete_session(&self, id: &str) -> Result<bool, SessionError> {
        self.cleanup_session(id).await;
        let deleted = self.storage.delete_session(id).await?;
        if deleted {
            info!(session_id = id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Clean up every active session and close storage.
    ///
    /// # Errors
    /// Returns error if storage fails to close.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        info!("Shutting down session registry");
        let sessions: Vec<Arc<AgentSession>> = {
            let mut slots = self.slots();
            slots.drain().filter_map(|(_, slot)| slot.get().cloned()).collect()
        };
        for session in &sessions {
            session.cleanup().await;
        }
        self.storage.close().await?;
        info!(sessions = sessions.len(), "Session registry stopped");
        Ok(())
    }
}
