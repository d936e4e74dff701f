//! Which events are written to durable storage.

use std::collections::HashSet;

use session_relay_core::{Event, EventKind};

/// Decides whether an event is persisted.
///
/// Every event still reaches telemetry and live subscribers; this only
/// filters the durable log.
pub trait PersistPolicy: Send + Sync {
    fn should_persist(&self, event: &Event) -> bool;
}

/// Skip incremental streaming deltas; keep everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipStreaming;

impl PersistPolicy for SkipStreaming {
    fn should_persist(&self, event: &Event) -> bool {
        !event.kind.is_streaming()
    }
}

/// Skip an explicit set of kinds.
#[derive(Debug, Clone, Default)]
pub struct SkipKinds {
    kinds: HashSet<EventKind>,
}

impl SkipKinds {
    #[must_use]
    pub fn new<I, K>(kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<EventKind>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }
}

impl PersistPolicy for SkipKinds {
    fn should_persist(&self, event: &Event) -> bool {
        !self.kinds.contains(&event.kind)
    }
}

impl<F> PersistPolicy for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn should_persist(&self, event: &Event) -> bool {
        self(event)
    }
}
