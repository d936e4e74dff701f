//! Scripted agent and registry harness shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use session_relay_core::{
    Agent, AgentError, AgentStatus, Event, EventKind, EventStream, ModelRef, NewSession,
    RunRequest, RunStream, SessionInfo, SessionUpdate, StorageError, StorageKind,
    StorageProvider,
};
use session_relay_server::{AgentFactory, ServerConfig, SessionRegistry, TelemetrySink};
use session_relay_storage::MemoryStorage;
use tokio::sync::Notify;

/// What the next run of a scripted agent does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Stream "he" + "llo", then answer "hello".
    Answer,
    /// Fail after echoing the input.
    Fail,
    /// Block until aborted.
    Hang,
}

pub struct ScriptedAgent {
    pub model: ModelRef,
    script: Mutex<Script>,
    events: EventStream,
    status: Mutex<AgentStatus>,
    running: AtomicBool,
    disposed: AtomicBool,
    started: Notify,
    abort: Notify,
}

impl ScriptedAgent {
    pub fn new(model: ModelRef, script: Script) -> Self {
        Self {
            model,
            script: Mutex::new(script),
            events: EventStream::new(),
            status: Mutex::new(AgentStatus::Idle),
            running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            started: Notify::new(),
            abort: Notify::new(),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Resolves once a `Hang` run is blocked.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    fn set_status(&self, status: AgentStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn emit(&self, event: Event) -> Event {
        self.events.push(event.clone());
        event
    }

    fn answer(&self) -> Vec<Event> {
        vec![
            Event::streaming_message("he"),
            Event::streaming_message("llo"),
            Event::assistant_message("hello"),
            Event::new(EventKind::FinalAnswer).with("content", "hello"),
        ]
    }

    async fn hang(&self) -> AgentError {
        self.running.store(true, Ordering::SeqCst);
        self.started.notify_one();
        self.abort.notified().await;
        self.set_status(AgentStatus::Aborted);
        AgentError::Aborted
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn initialize(&self) -> Result<(), AgentError> {
        self.set_status(AgentStatus::Ready);
        Ok(())
    }

    async fn run(&self, request: RunRequest) -> Result<Event, AgentError> {
        if self.is_disposed() {
            return Err(AgentError::Disposed);
        }
        self.set_status(AgentStatus::Executing);
        self.emit(Event::user_message(request.input));

        let script = *self.script.lock().unwrap();
        match script {
            Script::Answer => {
                let mut last = None;
                for event in self.answer() {
                    last = Some(self.emit(event));
                }
                self.set_status(AgentStatus::Ready);
                last.ok_or_else(|| AgentError::Execution("empty script".into()))
            }
            Script::Fail => {
                self.set_status(AgentStatus::Error);
                Err(AgentError::Execution("upstream 500: api key sk-secret".into()))
            }
            Script::Hang => Err(self.hang().await),
        }
    }

    async fn run_streaming(&self, request: RunRequest) -> Result<RunStream, AgentError> {
        if self.is_disposed() {
            return Err(AgentError::Disposed);
        }
        let script = *self.script.lock().unwrap();
        let mut items = vec![Ok(self.emit(Event::user_message(request.input)))];
        match script {
            Script::Answer => items.extend(self.answer().into_iter().map(|e| Ok(self.emit(e)))),
            Script::Fail => {
                items.push(Ok(self.emit(Event::streaming_message("par"))));
                items.push(Err(AgentError::Execution("connection reset".into())));
            }
            Script::Hang => items.push(Err(self.hang().await)),
        }
        Ok(futures::stream::iter(items).boxed())
    }

    async fn abort(&self) -> bool {
        if self.running.swap(false, Ordering::SeqCst) {
            self.abort.notify_one();
            true
        } else {
            false
        }
    }

    fn status(&self) -> AgentStatus {
        *self.status.lock().unwrap()
    }

    fn event_stream(&self) -> &EventStream {
        &self.events
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.set_status(AgentStatus::Disposed);
    }
}

/// Records every agent the registry asks for.
#[derive(Default)]
pub struct Agents {
    pub created: Mutex<Vec<(String, Arc<ScriptedAgent>)>>,
    pub script: Mutex<Option<Script>>,
}

impl Agents {
    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Most recent agent created for `session_id`.
    pub fn for_session(&self, session_id: &str) -> Arc<ScriptedAgent> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == session_id)
            .map(|(_, agent)| Arc::clone(agent))
            .unwrap()
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn AgentFactory> {
        let agents = Arc::clone(self);
        Arc::new(
            move |session: &SessionInfo, model: &ModelRef| -> Result<Arc<dyn Agent>, AgentError> {
                let script = agents.script.lock().unwrap().unwrap_or(Script::Answer);
                let agent = Arc::new(ScriptedAgent::new(model.clone(), script));
                agents
                    .created
                    .lock()
                    .unwrap()
                    .push((session.id.clone(), Arc::clone(&agent)));
                Ok(agent as Arc<dyn Agent>)
            },
        )
    }
}

pub struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub agents: Arc<Agents>,
}

pub async fn harness(config: ServerConfig) -> Harness {
    harness_with_telemetry(config, None).await
}

pub async fn harness_with_telemetry(
    config: ServerConfig,
    telemetry: Option<Arc<dyn TelemetrySink>>,
) -> Harness {
    let agents = Arc::new(Agents::default());
    let registry = SessionRegistry::from_config(&config, agents.factory(), telemetry)
        .await
        .unwrap();
    Harness {
        registry: Arc::new(registry),
        agents,
    }
}

pub async fn harness_with_storage(
    storage: Arc<dyn StorageProvider>,
    config: &ServerConfig,
) -> Harness {
    storage.initialize().await.unwrap();
    let agents = Arc::new(Agents::default());
    let registry = SessionRegistry::new(storage, config, agents.factory(), None);
    Harness {
        registry: Arc::new(registry),
        agents,
    }
}

/// Keeps every event it is handed and counts flushes.
#[derive(Default)]
pub struct RecordingTelemetry {
    pub events: Mutex<Vec<(String, Event)>>,
    pub flushes: AtomicUsize,
}

impl RecordingTelemetry {
    pub fn kinds_for(&self, session_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, e)| e.kind.as_str().to_owned())
            .collect()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySink for RecordingTelemetry {
    fn record(&self, session_id: &str, event: &Event) {
        self.events
            .lock()
            .unwrap()
            .push((session_id.to_owned(), event.clone()));
    }

    async fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Memory storage whose event reads fail as if the disk went away.
pub struct FlakyHistory {
    inner: MemoryStorage,
}

impl FlakyHistory {
    pub fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
        }
    }
}

#[async_trait]
impl StorageProvider for FlakyHistory {
    fn kind(&self) -> StorageKind {
        self.inner.kind()
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.inner.initialize().await
    }

    async fn create_session(&self, session: NewSession) -> Result<SessionInfo, StorageError> {
        self.inner.create_session(session).await
    }

    async fn get_session_info(&self, id: &str) -> Result<Option<SessionInfo>, StorageError> {
        self.inner.get_session_info(id).await
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionInfo>, StorageError> {
        self.inner.get_all_sessions().await
    }

    async fn update_session_info(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionInfo, StorageError> {
        self.inner.update_session_info(id, update).await
    }

    async fn delete_session(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.delete_session(id).await
    }

    async fn save_event(&self, id: &str, event: &Event) -> Result<(), StorageError> {
        self.inner.save_event(id, event).await
    }

    async fn get_session_events(&self, _id: &str) -> Result<Vec<Event>, StorageError> {
        Err(StorageError::Io(std::io::Error::other("disk unavailable")))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }
}

pub fn kinds(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.kind.as_str()).collect()
}

pub fn no_metadata() -> HashMap<String, serde_json::Value> {
    HashMap::new()
}
