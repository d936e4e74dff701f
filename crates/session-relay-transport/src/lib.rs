//! Live push layer for session viewers.
//!
//! Provides:
//! - Push vocabulary (`ServerMessage`, `Phase`) and the pure event mapping
//! - `EventStreamBridge` - per-session subscriber fan-out

pub mod bridge;
pub mod protocol;

pub use bridge::{EventStreamBridge, Handler, StreamConnection, SubscriberId};
pub use protocol::{Phase, ServerMessage, map_event, phase_for};
