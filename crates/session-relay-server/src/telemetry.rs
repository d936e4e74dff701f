//! Optional copy of every session event for analytics.

use async_trait::async_trait;
use session_relay_core::Event;
use tracing::debug;

/// Receives every event a session's agent emits, unfiltered.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Record one event. Must not block.
    fn record(&self, session_id: &str, event: &Event);

    /// Push out anything buffered.
    async fn flush(&self);
}

/// Logs each event as a `tracing` debug record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

#[async_trait]
impl TelemetrySink for TracingTelemetry {
    fn record(&self, session_id: &str, event: &Event) {
        debug!(
            target: "session_relay::telemetry",
            session_id,
            event_id = %event.id,
            kind = %event.kind,
            timestamp = event.timestamp,
            "Session event"
        );
    }

    async fn flush(&self) {}
}
