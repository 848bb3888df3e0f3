//! Realtime stream modules.
//!
//! - `client`: websocket transport, handshake, and reconnect handling.
//! - `proto`: commands and events exchanged with the stream service.
//! - `registry`: subscribed session ids, replayed on every connect.
//! - `router`: per-kind and wildcard event handlers.
//! - `session`: cached session records driven by events and snapshots.

/// Websocket connection manager.
pub mod client;
/// Stream protocol messages.
pub mod proto;
/// Subscription intent that survives reconnects.
pub mod registry;
/// Event dispatch to consumer callbacks.
pub mod router;
/// Session record cache enforcing the session state machine.
pub mod session;
mod state;

pub use state::ConnectionState;
