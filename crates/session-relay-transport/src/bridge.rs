//! Per-session fan-out of push messages to live subscribers.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use futures::StreamExt;
use session_relay_core::{Event, EventStream};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

use crate::protocol::{Phase, ServerMessage, map_event, phase_for};

/// Subscriber callback. Returning `false` ends the subscription.
pub type Handler = Arc<dyn Fn(&ServerMessage) -> bool + Send + Sync>;

/// Handle returned by [`EventStreamBridge::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Live link between an agent's event source and a bridge.
///
/// Dropping it (or calling [`disconnect`](Self::disconnect)) stops
/// forwarding.
pub struct StreamConnection {
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    /// Stop forwarding events.
    pub fn disconnect(mut self) {
        self.stop();
    }

    /// Whether the forwarding task is still running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Converts one session's internal events into [`ServerMessage`]s and
/// delivers them to whoever is subscribed at that moment.
///
/// Delivery is synchronous and at-most-once; there is no queue, so a
/// subscriber added after an emission never sees it.
pub struct EventStreamBridge {
    session_id: String,
    subscribers: Mutex<Vec<(SubscriberId, Handler)>>,
    next_id: AtomicU64,
    phase: Mutex<Option<Phase>>,
}

impl EventStreamBridge {
    /// Create a bridge for `session_id`.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            phase: Mutex::new(None),
        }
    }

    /// Session this bridge belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Register a handler.
    pub fn subscribe<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.register(Arc::new(move |message: &ServerMessage| {
            handler(message);
            true
        }))
    }

    fn register(&self, handler: Handler) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    /// Register a channel-backed subscriber.
    ///
    /// Messages are queued on the returned receiver. Once the receiver is
    /// dropped the next emission removes the subscriber.
    #[must_use]
    pub fn channel(&self) -> (SubscriberId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(Arc::new(move |message: &ServerMessage| {
            tx.send(message.clone()).is_ok()
        }));
        (id, rx)
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `message` to every current subscriber.
    pub fn emit(&self, message: &ServerMessage) {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<(SubscriberId, Handler)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();

        trace!(
            session_id = %self.session_id,
            message = message.name(),
            subscribers = handlers.len(),
            "Emitting"
        );
        let gone: Vec<SubscriberId> = handlers
            .into_iter()
            .filter(|(_, handler)| !handler(message))
            .map(|(id, _)| id)
            .collect();
        if !gone.is_empty() {
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| !gone.contains(id));
            debug!(session_id = %self.session_id, dropped = gone.len(), "Pruned closed subscribers");
        }
    }

    /// Emit a phase change, suppressing repeats of the current phase.
    pub fn set_phase(&self, phase: Phase) {
        {
            let mut current = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == Some(phase) {
                return;
            }
            *current = Some(phase);
        }
        self.emit(&ServerMessage::Status { phase });
    }

    /// Last phase emitted.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Translate and deliver one internal event.
    pub fn forward(&self, event: &Event) {
        self.emit(&map_event(event));
        if let Some(phase) = phase_for(event) {
            self.set_phase(phase);
        }
    }

    /// Tell subscribers the session is gone.
    pub fn emit_closed(&self) {
        self.set_phase(Phase::Idle);
        self.emit(&ServerMessage::Closed {
            session_id: self.session_id.clone(),
        });
    }

    /// Forward everything `source` emits from now on.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn connect_to_agent_event_stream(self: &Arc<Self>, source: &EventStream) -> StreamConnection {
        // Subscribe before spawning so no event pushed after this call is missed.
        let mut events = source.live_stream();
        let bridge = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                bridge.forward(&event);
            }
            debug!(session_id = %bridge.session_id, "Agent event source ended");
        });
        StreamConnection { task: Some(task) }
    }
}
