//! Exclusive-mode running-session record.
//!
//! Advisory and process-local: it only coordinates sessions owned by the
//! same registry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use session_relay_core::SessionId;
use tracing::debug;

/// Tracks which session is currently running.
#[derive(Debug, Default)]
pub struct ExclusiveGuard {
    exclusive: bool,
    running: Mutex<Option<SessionId>>,
}

impl ExclusiveGuard {
    #[must_use]
    pub fn new(exclusive: bool) -> Self {
        Self {
            exclusive,
            running: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<SessionId>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether exclusive mode is enabled.
    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// False only when exclusive mode is on and a session is running.
    #[must_use]
    pub fn can_accept_new_request(&self) -> bool {
        !self.exclusive || self.slot().is_none()
    }

    /// Record `id` as the running session.
    pub fn set_running_session(&self, id: &str) {
        *self.slot() = Some(id.to_owned());
    }

    /// Clear the record, but only if it still names `id`.
    ///
    /// Returns whether the record was cleared.
    pub fn clear_running_session(&self, id: &str) -> bool {
        let mut slot = self.slot();
        if slot.as_deref() == Some(id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Currently recorded running session.
    #[must_use]
    pub fn running_session(&self) -> Option<SessionId> {
        self.slot().clone()
    }

    /// Check and record in one step.
    ///
    /// Returns `None` if exclusive mode refuses the request.
    #[must_use]
    pub fn try_enter(self: &Arc<Self>, id: &str) -> Option<RunningGuard> {
        let mut slot = self.slot();
        if self.exclusive && slot.is_some() {
            return None;
        }
        *slot = Some(id.to_owned());
        drop(slot);

        debug!(session_id = id, "Session marked running");
        Some(RunningGuard {
            guard: Arc::clone(self),
            session_id: id.to_owned(),
        })
    }
}

/// Clears the running-session record when dropped.
///
/// Covers normal completion, errors, and a caller dropping a stream
/// half-way through.
#[derive(Debug)]
pub struct RunningGuard {
    guard: Arc<ExclusiveGuard>,
    session_id: SessionId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.guard.clear_running_session(&self.session_id) {
            debug!(session_id = %self.session_id, "Session no longer running");
        }
    }
}
