//! Rust SDK for the JSS comparison streaming service.
//!
//! The crate is organized by transport surface:
//! - `stream`: persistent websocket client, event routing, and session cache.
//! - `control`: HTTP client for starting, inspecting, and cancelling sessions.
//! - `poller`: control-plane fallback for following a session without a stream.
//! - `comparison`: facade combining the stream and control clients.
//! - `retry`: shared backoff, retry, and timeout utilities.

/// Stream and control clients behind one handle.
pub mod comparison;
/// Control API client and request/response types.
pub mod control;
/// Polling fallback over the control API.
pub mod poller;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Realtime stream client, protocol types, and session state helpers.
pub mod stream;

pub use comparison::ComparisonClient;
pub use control::{ControlApiClient, ControlApiError, StreamComparisonRequest};
pub use stream::client::{ConnectionEvent, StreamClient, StreamClientError, StreamClientOptions};
pub use stream::proto::{EventKind, ServerEvent, SessionStatus};
pub use stream::router::{EventRouter, HandlerSet};
pub use stream::session::{SessionRecord, SessionTracker};
pub use stream::ConnectionState;
