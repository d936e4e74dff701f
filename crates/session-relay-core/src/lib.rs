//! Core abstractions for durable agent sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionInfo` / `Event` - The persisted data model
//! - `EventStream` - Broadcast source for an agent's internal events
//! - `StorageProvider` - Pluggable durable storage contract
//! - `Agent` - The agent contract sessions drive

pub mod agent;
pub mod event;
pub mod event_stream;
pub mod session;
pub mod traits;

pub use agent::{Agent, AgentError, AgentStatus, ModelRef, RunRequest, RunStream};
pub use event::{Event, EventKind};
pub use event_stream::{EventStream, EventSubscription};
pub use session::{
    ModelConfig, NewSession, SessionId, SessionInfo, SessionUpdate, bump_timestamp, now_ms,
};
pub use traits::{StorageError, StorageKind, StorageProvider};
