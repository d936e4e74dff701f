//! Session hosting for durable agent conversations.
//!
//! Provides:
//! - `SessionRegistry` - Active sessions, restore on demand, lifecycle routing
//! - `AgentSession` - One agent bound to one session
//! - `ExclusiveGuard` - Process-wide single-run policy
//! - `ServerConfig` - JSON configuration

pub mod agent_session;
pub mod config;
pub mod guard;
pub mod logging;
pub mod model;
pub mod policy;
pub mod registry;
pub mod telemetry;

pub use agent_session::{AgentSession, ErrorInfo, QueryResult, SessionServices};
pub use config::{ConfigError, ServerConfig};
pub use guard::{ExclusiveGuard, RunningGuard};
pub use model::{AgentFactory, ModelResolver};
pub use policy::{PersistPolicy, SkipKinds, SkipStreaming};
pub use registry::{SessionError, SessionRegistry};
pub use telemetry::{TelemetrySink, TracingTelemetry};
