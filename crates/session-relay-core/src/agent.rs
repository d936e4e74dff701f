//! The agent contract consumed by sessions.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Event, EventStream, ModelConfig};

/// Provider/model pair an agent runs with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
}

impl ModelRef {
    #[must_use]
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
        }
    }
}

impl From<&ModelConfig> for ModelRef {
    fn from(config: &ModelConfig) -> Self {
        Self::new(config.provider.clone(), config.model_id.clone())
    }
}

/// Agent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Created but not yet initialized.
    Idle,
    /// Ready to accept a run.
    Ready,
    /// A run is in flight.
    Executing,
    /// The last run was aborted.
    Aborted,
    /// The last run failed.
    Error,
    /// Disposed; no further runs.
    Disposed,
}

/// One run of the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// User input.
    pub input: String,
    /// Model to run with.
    pub model: ModelRef,
}

/// Agent execution error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Run aborted")]
    Aborted,
    #[error("Agent not initialized")]
    NotInitialized,
    #[error("Agent disposed")]
    Disposed,
    #[error("Model error: {0}")]
    Model(String),
    #[error("Execution failed: {0}")]
    Execution(String),
}

/// Stream of run events produced by a streaming run.
pub type RunStream = BoxStream<'static, Result<Event, AgentError>>;

/// An LLM-driven agent bound to one session.
///
/// Implementations push every event they produce (including the ones
/// yielded by `run_streaming`) to their `event_stream()`.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Prepare the agent for runs.
    async fn initialize(&self) -> Result<(), AgentError>;

    /// Run to completion, returning the final answer event.
    async fn run(&self, request: RunRequest) -> Result<Event, AgentError>;

    /// Run, yielding events as they are produced.
    async fn run_streaming(&self, request: RunRequest) -> Result<RunStream, AgentError>;

    /// Request cooperative cancellation.
    ///
    /// Returns whether an in-flight run was interrupted.
    async fn abort(&self) -> bool;

    /// Current status.
    fn status(&self) -> AgentStatus;

    /// The agent's internal event source.
    fn event_stream(&self) -> &EventStream;

    /// Release resources. The agent is unusable afterwards.
    async fn dispose(&self);
}
