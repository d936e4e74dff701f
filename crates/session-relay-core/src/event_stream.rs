//! Broadcast event source owned by an agent.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::Event;

/// Default channel capacity before slow receivers start lagging.
const CHANNEL_CAPACITY: usize = 10_000;

/// A receiver plus the number of events pushed before it subscribed.
pub struct EventSubscription {
    /// Live receiver.
    pub receiver: broadcast::Receiver<Event>,
    /// Events pushed before this subscription existed.
    pub pushed_before: u64,
}

/// Agent-side event source.
///
/// Every event the agent produces is pushed here exactly once; any number
/// of consumers subscribe. Events pushed before a subscription are not
/// replayed to it.
pub struct EventStream {
    sender: broadcast::Sender<Event>,
    // Guards the counter and the send together so subscribe() sees a
    // consistent "pushed so far" value.
    pushed: Mutex<u64>,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStream {
    /// Create a new event stream.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a new event stream with a custom channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            pushed: Mutex::new(0),
        }
    }

    /// Push an event to all live subscribers.
    pub fn push(&self, event: Event) {
        let mut pushed = self.pushed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *pushed += 1;
        let _ = self.sender.send(event); // no subscribers is fine
    }

    /// Total number of events pushed so far.
    #[must_use]
    pub fn pushed(&self) -> u64 {
        *self.pushed.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Subscribe to live events.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        let pushed = self.pushed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        EventSubscription {
            receiver: self.sender.subscribe(),
            pushed_before: *pushed,
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stream of live events. Lagged gaps are skipped.
    #[must_use]
    pub fn live_stream(&self) -> futures::stream::BoxStream<'static, Event> {
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Forward a stream of events into this source.
    pub fn spawn_forwarder<S>(self: Arc<Self>, stream: S) -> tokio::task::JoinHandle<()>
    where
        S: futures::Stream<Item = Event> + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(event) = stream.next().await {
                self.push(event);
            }
        })
    }
}
