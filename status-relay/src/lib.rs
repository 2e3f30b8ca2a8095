//! # status-relay — Real-time presence and typing-status relay
//!
//! Clients join a numbered room over WebSocket and report a small state
//! vector (active flag, last message read, last keystroke). Every occupant
//! sees the current state of every other occupant, live.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   Event queue   ┌──────────────┐
//! │ ConnectionActor  │ ──────────────► │  dispatch    │
//! │ (per user)       │                 │  (single)    │
//! └────────▲─────────┘                 └──────┬───────┘
//!          │ send()                           │
//!          │                          ┌───────▼───────┐
//!          └───────────────────────── │ RoomRegistry  │
//!                                     │ (fan-out)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages and keepalive frames
//! - [`state`] — Per-user activity state and newcomer snapshots
//! - [`actor`] — Per-connection read/write loops
//! - [`registry`] — Room membership, fan-out and eviction
//! - [`server`] — HTTP routes, dispatch loop, shutdown draining

pub mod protocol;
pub mod state;
pub mod actor;
pub mod registry;
pub mod server;
pub mod error;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use protocol::{Inbound, Message, MessageKind, ProtocolError};
pub use state::State;
pub use actor::{ConnectionActor, Event, EventSender, Frame};
pub use registry::{RegistryError, RoomRegistry, RoomStats};
pub use server::{RelayServer, ServerConfig};
pub use error::RelayError;
