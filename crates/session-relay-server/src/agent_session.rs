//! One agent bound to one session.
//!
//! Owns the single handler on the agent's event source that writes the
//! durable log and feeds telemetry, the bridge connection for live
//! viewers, and the run lock that keeps a session to one run at a time.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use session_relay_core::{
    Agent, AgentError, Event, ModelConfig, ModelRef, RunRequest, SessionId, SessionInfo,
    SessionUpdate, StorageError, StorageProvider,
};
use session_relay_transport::{EventStreamBridge, StreamConnection};
use tokio::{
    sync::{Mutex as AsyncMutex, broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    guard::{ExclusiveGuard, RunningGuard},
    policy::PersistPolicy,
    telemetry::TelemetrySink,
};

pub const AGENT_EXECUTION_ERROR: &str = "AGENT_EXECUTION_ERROR";
pub const ABORTED: &str = "ABORTED";
pub const AGENT_NOT_READY: &str = "AGENT_NOT_READY";
pub const SESSION_BUSY: &str = "SESSION_BUSY";

/// How long cleanup waits for queued events to be persisted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-safe error description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.into(),
        }
    }

    /// Stable code and generic message for an agent failure.
    ///
    /// The underlying detail is logged by the caller, never returned.
    #[must_use]
    pub fn from_agent_error(err: &AgentError) -> Self {
        match err {
            AgentError::Aborted => Self::new(ABORTED, "The run was aborted"),
            AgentError::NotInitialized | AgentError::Disposed => {
                Self::new(AGENT_NOT_READY, "The agent is not ready")
            }
            AgentError::Model(_) | AgentError::Execution(_) => {
                Self::new(AGENT_EXECUTION_ERROR, "The agent failed to complete the request")
            }
        }
    }

    fn busy() -> Self {
        Self::new(SESSION_BUSY, "Another session is already running")
    }

    fn to_event(&self) -> Event {
        Event::terminal_error(&self.code, self.message.clone())
    }
}

/// Outcome of a non-streaming run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryResult {
    Success { response: Event },
    Failure { error: ErrorInfo },
}

impl QueryResult {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The error, for a failed run.
    #[must_use]
    pub const fn error(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error),
        }
    }
}

/// Collaborators every session shares.
#[derive(Clone)]
pub struct SessionServices {
    pub storage: Arc<dyn StorageProvider>,
    pub guard: Arc<ExclusiveGuard>,
    pub policy: Arc<dyn PersistPolicy>,
    pub telemetry: Option<Arc<dyn TelemetrySink>>,
}

struct EventHandler {
    task: JoinHandle<()>,
    /// Total events the handler has finished with, counting those pushed
    /// before it subscribed.
    observed: watch::Receiver<u64>,
}

/// An agent bound to one session.
pub struct AgentSession {
    id: SessionId,
    agent: Arc<dyn Agent>,
    services: SessionServices,
    bridge: Arc<EventStreamBridge>,
    model: Mutex<ModelRef>,
    run_lock: Arc<AsyncMutex<()>>,
    handler: Mutex<Option<EventHandler>>,
    connection: Mutex<Option<StreamConnection>>,
}

impl AgentSession {
    /// Bind `agent` to `info`. Nothing runs until [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(
        info: &SessionInfo,
        agent: Arc<dyn Agent>,
        model: ModelRef,
        services: SessionServices,
    ) -> Self {
        Self {
            bridge: Arc::new(EventStreamBridge::new(info.id.clone())),
            id: info.id.clone(),
            agent,
            services,
            model: Mutex::new(model),
            run_lock: Arc::new(AsyncMutex::new(())),
            handler: Mutex::new(None),
            connection: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Live fan-out for this session.
    #[must_use]
    pub fn bridge(&self) -> &Arc<EventStreamBridge> {
        &self.bridge
    }

    #[must_use]
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    /// Model the next run will use.
    #[must_use]
    pub fn model(&self) -> ModelRef {
        self.model.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Start the agent, install the event handler and connect the bridge.
    ///
    /// Calling it again only re-initializes the agent.
    ///
    /// # Errors
    /// Returns error if the agent fails to initialize.
    pub async fn initialize(&self) -> Result<(), AgentError> {
        self.agent.initialize().await?;

        {
            let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
            if handler.is_none() {
                *handler = Some(self.spawn_handler());
            }
        }
        {
            let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
            if connection.is_none() {
                *connection = Some(
                    self.bridge
                        .connect_to_agent_event_stream(self.agent.event_stream()),
                );
            }
        }

        debug!(session_id = %self.id, "Agent session initialized");
        Ok(())
    }

    fn spawn_handler(&self) -> EventHandler {
        let subscription = self.agent.event_stream().subscribe();
        let (observed_tx, observed) = watch::channel(subscription.pushed_before);
        let mut receiver = subscription.receiver;

        let session_id = self.id.clone();
        let storage = Arc::clone(&self.services.storage);
        let policy = Arc::clone(&self.services.policy);
        let telemetry = self.services.telemetry.clone();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if policy.should_persist(&event) {
                            // Awaited in order, so the durable log follows emission order.
                            if let Err(e) = storage.save_event(&session_id, &event).await {
                                error!(
                                    session_id = %session_id,
                                    event_id = %event.id,
                                    kind = %event.kind,
                                    error = %e,
                                    "Failed to persist event"
                                );
                            }
                        }
                        if let Some(sink) = &telemetry {
                            sink.record(&session_id, &event);
                        }
                        observed_tx.send_modify(|n| *n += 1);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session_id, skipped, "Event handler lagged, events not persisted");
                        observed_tx.send_modify(|n| *n += skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        EventHandler { task, observed }
    }

    /// Wait until the handler has dealt with every event pushed so far.
    async fn settle(&self) {
        let target = self.agent.event_stream().pushed();
        let observed = {
            let handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
            handler.as_ref().map(|h| h.observed.clone())
        };
        if let Some(mut observed) = observed {
            if observed.wait_for(|n| *n >= target).await.is_err() {
                warn!(session_id = %self.id, "Event handler stopped before settling");
            }
        }
    }

    /// Events pushed that the handler has not finished with.
    fn pending(&self) -> u64 {
        let observed = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |h| *h.observed.borrow());
        self.agent.event_stream().pushed().saturating_sub(observed)
    }

    fn request(&self, input: &str) -> RunRequest {
        RunRequest {
            input: input.to_owned(),
            model: self.model(),
        }
    }

    fn enter(&self) -> Option<RunningGuard> {
        let entered = self.services.guard.try_enter(&self.id);
        if entered.is_none() {
            warn!(
                session_id = %self.id,
                running = ?self.services.guard.running_session(),
                "Refusing run in exclusive mode"
            );
        }
        entered
    }

    /// Run to completion. Never fails; errors come back as
    /// [`QueryResult::Failure`].
    pub async fn run_query(&self, input: &str) -> QueryResult {
        let _run = self.run_lock.lock().await;
        let Some(_running) = self.enter() else {
            return QueryResult::Failure {
                error: ErrorInfo::busy(),
            };
        };

        info!(session_id = %self.id, "Running query");
        let outcome = match self.agent.run(self.request(input)).await {
            Ok(response) => QueryResult::Success { response },
            Err(e) => {
                error!(session_id = %self.id, error = %e, "Query failed");
                let error = ErrorInfo::from_agent_error(&e);
                self.agent.event_stream().push(error.to_event());
                QueryResult::Failure { error }
            }
        };
        self.settle().await;
        outcome
    }

    /// Run, yielding events as they arrive.
    ///
    /// Never fails: an error ends the stream with one terminal error event.
    /// Dropping the stream early releases the run lock and the running
    /// record.
    pub fn run_query_streaming(self: &Arc<Self>, input: &str) -> BoxStream<'static, Event> {
        let session = Arc::clone(self);
        let input = input.to_owned();

        async_stream::stream! {
            let _run = Arc::clone(&session.run_lock).lock_owned().await;
            let Some(_running) = session.enter() else {
                yield ErrorInfo::busy().to_event();
                return;
            };

            info!(session_id = %session.id, "Running streaming query");
            let mut failure = None;
            match session.agent.run_streaming(session.request(&input)).await {
                Ok(mut events) => {
                    while let Some(item) = events.next().await {
                        match item {
                            Ok(event) => yield event,
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => failure = Some(e),
            }
            let terminal = failure.map(|e| {
                error!(session_id = %session.id, error = %e, "Streaming query failed");
                let event = ErrorInfo::from_agent_error(&e).to_event();
                session.agent.event_stream().push(event.clone());
                event
            });
            session.settle().await;

            if let Some(event) = terminal {
                yield event;
            }
        }
        .boxed()
    }

    /// Ask the agent to stop the current run.
    ///
    /// Returns whether a run was interrupted. Does not wait for the run
    /// lock, so it works while a run is in flight.
    pub async fn abort_query(&self) -> bool {
        let aborted = self.agent.abort().await;
        if aborted {
            self.services.guard.clear_running_session(&self.id);
            info!(session_id = %self.id, "Query aborted");
        }
        aborted
    }

    /// Persist a new model choice for future runs.
    ///
    /// # Errors
    /// Returns error if the session record cannot be updated.
    pub async fn update_model_config(&self, model: ModelRef) -> Result<SessionInfo, StorageError> {
        let config = ModelConfig::new(model.provider.clone(), model.model_id.clone());
        let info = self
            .services
            .storage
            .update_session_info(&self.id, SessionUpdate::model_config(&config))
            .await?;
        *self.model.lock().unwrap_or_else(PoisonError::into_inner) = model;
        Ok(info)
    }

    /// Detach from the agent and release it.
    ///
    /// Events already emitted are persisted first. If the handler has not
    /// caught up within a few seconds the rest are dropped with a warning.
    pub async fn cleanup(&self) {
        if tokio::time::timeout(DRAIN_TIMEOUT, self.settle()).await.is_err() {
            warn!(
                session_id = %self.id,
                pending = self.pending(),
                "Gave up waiting for queued events during cleanup"
            );
        }

        let handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handler) = handler {
            handler.task.abort();
        }
        let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(connection) = connection {
            connection.disconnect();
        }

        self.agent.dispose().await;
        self.services.guard.clear_running_session(&self.id);
        if let Some(sink) = &self.services.telemetry {
            sink.flush().await;
        }
        self.bridge.emit_closed();
        info!(session_id = %self.id, "Agent session cleaned up");
    }
}
