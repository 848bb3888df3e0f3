//! High-level client combining the stream connection and the control API.

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::control::{
    AckResponse, ControlApiClient, ControlApiError, HealthCheck, StartComparisonResponse,
    StreamComparisonRequest, StreamStats,
};
use crate::poller::{PollError, SessionPoller};
use crate::stream::client::{ConnectionEvent, StreamClient, StreamClientError};
use crate::stream::proto::SessionInfo;
use crate::stream::router::EventRouter;
use crate::stream::session::{SessionRecord, SessionTracker};

/// Starts, follows and cancels comparison sessions.
///
/// Sessions started through [`ComparisonClient::start_session`] are
/// subscribed automatically, so no event is missed between creation and the
/// first handler call.
#[derive(Debug)]
pub struct ComparisonClient {
    stream: StreamClient,
    control: ControlApiClient,
}

impl ComparisonClient {
    pub fn new(stream: StreamClient, control: ControlApiClient) -> Self {
        Self { stream, control }
    }

    /// Client for the default local deployment.
    pub fn with_defaults() -> Result<Self, ControlApiError> {
        Ok(Self::new(StreamClient::new(), ControlApiClient::new()?))
    }

    pub fn stream(&self) -> &StreamClient {
        &self.stream
    }

    pub fn control(&self) -> &ControlApiClient {
        &self.control
    }

    pub async fn connect(&self) -> Result<String, StreamClientError> {
        self.stream.connect().await
    }

    pub async fn disconnect(&self) {
        self.stream.disconnect().await;
    }

    /// Creates a session and subscribes to it.
    ///
    /// When the stream is not connected the subscription is sent on the next
    /// successful connect. A failed create call subscribes nothing.
    pub async fn start_session(
        &self,
        request: &StreamComparisonRequest,
    ) -> Result<StartComparisonResponse, ControlApiError> {
        let response = self.control.start_comparison(request).await?;
        let request_data = serde_json::to_value(request).unwrap_or_else(|err| {
            warn!(
                event = "session_request_data_dropped",
                session_id = %response.session_id,
                error = %err
            );
            Value::Null
        });
        self.stream
            .sessions()
            .seed(&response.session_id, request_data);
        let sent = self.stream.subscribe(response.session_id.clone());
        info!(
            event = "session_started",
            session_id = %response.session_id,
            subscribed_now = sent
        );
        Ok(response)
    }

    /// Cancels a session and marks the cached record `cancelled`.
    pub async fn cancel_session(&self, session_id: &str) -> Result<AckResponse, ControlApiError> {
        let ack = self.control.cancel_session(session_id).await?;
        self.stream.sessions().mark_cancelled(session_id);
        Ok(ack)
    }

    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo, ControlApiError> {
        self.control.session_info(session_id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ControlApiError> {
        self.control.list_sessions().await
    }

    pub async fn health(&self) -> Result<HealthCheck, ControlApiError> {
        self.control.health().await
    }

    pub async fn stats(&self) -> Result<StreamStats, ControlApiError> {
        self.control.stats().await
    }

    pub async fn cleanup(&self) -> Result<AckResponse, ControlApiError> {
        self.control.cleanup().await
    }

    pub fn subscribe(&self, session_id: impl Into<String>) -> bool {
        self.stream.subscribe(session_id)
    }

    pub fn unsubscribe(&self, session_id: &str) -> bool {
        self.stream.unsubscribe(session_id)
    }

    pub fn router(&self) -> &EventRouter {
        self.stream.router()
    }

    pub fn sessions(&self) -> &SessionTracker {
        self.stream.sessions()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.stream.sessions().get(session_id)
    }

    /// Poller sharing this client's session cache and router.
    pub fn poller(&self) -> SessionPoller {
        SessionPoller::new(self.control.clone())
            .with_tracker(self.stream.sessions().clone())
            .with_router(self.stream.router().clone())
    }

    /// Follows a session over the control API until it is terminal.
    pub async fn poll_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionRecord, PollError> {
        self.poller().poll_until_terminal(session_id, cancel).await
    }

    /// Follows a session until it is terminal.
    ///
    /// While the stream is connected the session is subscribed and its cached
    /// record is watched. Without a connection, or once the connection fails
    /// or closes, the control API is polled instead.
    pub async fn follow_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionRecord, PollError> {
        if !self.stream.is_connected() {
            return self.poll_session(session_id, cancel).await;
        }

        let mut connection = self.stream.connection_events();
        let mut changes = self.stream.sessions().changes();
        self.stream.subscribe(session_id);
        loop {
            if let Some(record) = self.session(session_id).filter(SessionRecord::is_terminal) {
                return Ok(record);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                event = connection.recv() => match event {
                    Ok(ConnectionEvent::ConnectionFailed { .. } | ConnectionEvent::Closed)
                    | Err(RecvError::Closed) => {
                        info!(event = "session_follow_polling", session_id);
                        return self.poll_session(session_id, cancel).await;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                },
                changed = changes.changed() => {
                    if changed.is_err() {
                        return self.poll_session(session_id, cancel).await;
                    }
                }
            }
        }
    }
}
