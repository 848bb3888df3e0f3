//! Persistent websocket connection to the comparison streaming service.
//!
//! A background worker task owns the socket. It completes the
//! `connection_established` handshake, replays the subscribed session set,
//! feeds every decoded event through the [`SessionTracker`] and the
//! [`EventRouter`], and reconnects with bounded backoff when the transport
//! drops unexpectedly.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, RetryPolicy};
use crate::stream::proto::{ClientMessage, ServerEvent};
use crate::stream::registry::SessionRegistry;
use crate::stream::router::EventRouter;
use crate::stream::session::SessionTracker;
use crate::stream::state::{ConnectionState, Link};

/// Default websocket endpoint of the streaming service.
pub const STREAM_ENDPOINT: &str = "ws://localhost:8000/api/v1/stream/ws";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default values used by [`StreamClientOptions`].
#[derive(Clone, Copy, Debug)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// Time allowed for `connection_established` after the socket opens.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    /// Interval between application-level pings.
    pub const PING_INTERVAL: Duration = Duration::from_secs(20);
    /// Buffered lifecycle notifications per subscriber.
    pub const EVENT_CAPACITY: usize = 64;
}

/// Runtime options for [`StreamClient`].
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    pub handshake_timeout: Duration,
    /// Reconnect schedule applied after an unexpected close.
    pub reconnect: RetryPolicy,
    /// `None` disables keepalive pings.
    pub ping_interval: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: StreamDefaults::HANDSHAKE_TIMEOUT,
            reconnect: RetryPolicy::reconnect(),
            ping_interval: Some(StreamDefaults::PING_INTERVAL),
            event_capacity: StreamDefaults::EVENT_CAPACITY,
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed, initially or after a reconnect.
    Connected { client_id: String },
    /// Reconnect attempt `attempt` will start after `delay`.
    Reconnecting { attempt: usize, delay: Duration },
    /// Reconnect attempts are exhausted. A new `connect()` is required.
    ConnectionFailed { attempts: usize },
    /// `disconnect()` was called.
    Closed,
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No `connection_established` arrived in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Stream protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    /// The client was closed with `disconnect()`.
    #[error("client is closed")]
    Closed,

    /// `disconnect()` interrupted a pending `connect()`.
    #[error("disconnected while connecting")]
    Disconnected,

    #[error("not connected")]
    NotConnected,

    /// Outbound message queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,
}

impl StreamClientError {
    /// Returns true for failures of the transport itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_) | Self::HandshakeTimeout(_) | Self::Protocol(_)
        )
    }
}

/// Handle for one logical connection to the streaming service.
///
/// Dropping the client cancels its worker.
pub struct StreamClient {
    endpoint: String,
    options: StreamClientOptions,
    link: Link,
    router: Arc<EventRouter>,
    tracker: SessionTracker,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    worker: Mutex<Option<WorkerHandle>>,
}

/// Spawned worker plus a token cancelled once the worker has exited and its
/// socket is dropped.
struct WorkerHandle {
    task: JoinHandle<()>,
    stopped: CancellationToken,
}

impl Default for StreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClient {
    /// Creates a client for [`STREAM_ENDPOINT`] with default options.
    pub fn new() -> Self {
        let options = StreamClientOptions::default();
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            endpoint: STREAM_ENDPOINT.to_string(),
            options,
            link: Link::new(),
            router: Arc::new(EventRouter::new()),
            tracker: SessionTracker::new(),
            events,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Sets an explicit stream endpoint. Trailing whitespace is trimmed.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    pub fn with_options(mut self, options: StreamClientOptions) -> Self {
        if options.event_capacity != self.options.event_capacity {
            let (events, _) = broadcast::channel(options.event_capacity.max(1));
            self.events = events;
        }
        self.options = options;
        self
    }

    /// Shares an existing router with this client.
    pub fn with_router(mut self, router: Arc<EventRouter>) -> Self {
        self.router = router;
        self
    }

    /// Shares an existing session cache with this client.
    pub fn with_tracker(mut self, tracker: SessionTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &StreamClientOptions {
        &self.options
    }

    /// Opens the connection and waits for `connection_established`.
    ///
    /// Returns the server-assigned client id. Calling this while connected
    /// returns the current id without reconnecting.
    pub async fn connect(&self) -> Result<String, StreamClientError> {
        if let Some(client_id) = self.link.begin_connect()? {
            return Ok(client_id);
        }

        info!(event = "stream_connecting", endpoint = %self.endpoint);
        let (ready_tx, ready_rx) = oneshot::channel();
        let stopped = CancellationToken::new();
        let worker = Worker {
            url: self.endpoint.clone(),
            options: self.options.clone(),
            link: self.link.clone(),
            router: Arc::clone(&self.router),
            tracker: self.tracker.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            _stopped: stopped.clone().drop_guard(),
        };
        let handle = WorkerHandle {
            task: tokio::spawn(worker.run(ready_tx)),
            stopped,
        };
        let previous = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.task.abort();
        }

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(StreamClientError::Disconnected),
        }
    }

    /// Closes the connection and stops any reconnection.
    ///
    /// Idempotent. The socket is released before this returns, for every
    /// concurrent caller, and exactly one [`ConnectionEvent::Closed`] is
    /// broadcast over the client's lifetime. A pending
    /// [`StreamClient::connect`] fails with [`StreamClientError::Disconnected`].
    pub async fn disconnect(&self) {
        let first = self.link.close();
        self.cancel.cancel();

        let stopped = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|worker| worker.stopped.clone());
        if let Some(stopped) = stopped {
            stopped.cancelled().await;
        }

        if first {
            info!(event = "stream_closed");
            let _ = self.events.send(ConnectionEvent::Closed);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Server-assigned id of the current connection.
    pub fn client_id(&self) -> Option<String> {
        self.link.client_id()
    }

    /// Subscribes to lifecycle notifications emitted from now on.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> SessionRegistry {
        SessionRegistry::new(self.link.clone())
    }

    /// See [`SessionRegistry::subscribe`].
    pub fn subscribe(&self, session_id: impl Into<String>) -> bool {
        self.registry().subscribe(session_id)
    }

    /// See [`SessionRegistry::unsubscribe`].
    pub fn unsubscribe(&self, session_id: &str) -> bool {
        self.registry().unsubscribe(session_id)
    }

    /// Sends a raw command on the live connection.
    pub fn send(&self, message: ClientMessage) -> Result<(), StreamClientError> {
        self.link.send(message)
    }

    /// Sends an application-level ping; the server answers with `pong`.
    pub fn ping(&self) -> Result<(), StreamClientError> {
        self.send(ClientMessage::Ping)
    }

    /// Asks the server for a `sessions_list` event.
    pub fn request_sessions(&self) -> Result<(), StreamClientError> {
        self.send(ClientMessage::GetSessions)
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.tracker
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("options", &self.options)
            .finish()
    }
}

enum SessionOutcome {
    Shutdown,
    Lost,
}

struct Handshake {
    socket: Socket,
    client_id: String,
    event: ServerEvent,
}

struct Worker {
    url: String,
    options: StreamClientOptions,
    link: Link,
    router: Arc<EventRouter>,
    tracker: SessionTracker,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    _stopped: DropGuard,
}

impl Worker {
    async fn run(self, ready_tx: oneshot::Sender<Result<String, StreamClientError>>) {
        let first = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StreamClientError::Disconnected),
            result = open_session(&self.url, self.options.handshake_timeout) => result,
        };

        let mut handshake = match first {
            Ok(handshake) => handshake,
            Err(err) => {
                self.link.fail();
                warn!(event = "stream_connect_failed", error = %err);
                let _ = ready_tx.send(Err(err));
                return;
            }
        };

        let mut ready_tx = Some(ready_tx);
        loop {
            match self.run_connected(handshake, &mut ready_tx).await {
                SessionOutcome::Shutdown => return,
                SessionOutcome::Lost => {}
            }
            match self.reconnect().await {
                Some(next) => handshake = next,
                None => return,
            }
        }
    }

    async fn run_connected(
        &self,
        handshake: Handshake,
        ready_tx: &mut Option<oneshot::Sender<Result<String, StreamClientError>>>,
    ) -> SessionOutcome {
        let Handshake {
            mut socket,
            client_id,
            event,
        } = handshake;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let Some(replay) = self.link.establish(&client_id, outbound_tx) else {
            let _ = socket.close(None).await;
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(StreamClientError::Disconnected));
            }
            return SessionOutcome::Shutdown;
        };

        info!(
            event = "stream_connected",
            client_id = %client_id,
            replayed = replay.len()
        );
        self.deliver(&event);
        let _ = self.events.send(ConnectionEvent::Connected {
            client_id: client_id.clone(),
        });
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(client_id));
        }

        for session_id in replay {
            let command = ClientMessage::Subscribe { session_id };
            if send_client_message(&mut socket, &command).await.is_err() {
                return self.connection_lost("replay_failed");
            }
        }

        let mut keepalive = self
            .options
            .ping_interval
            .filter(|period| !period.is_zero())
            .map(|period| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = socket.close(None).await;
                    return SessionOutcome::Shutdown;
                }
                Some(command) = outbound_rx.recv() => {
                    debug!(event = "stream_command_sent", command = ?command);
                    if send_client_message(&mut socket, &command).await.is_err() {
                        return self.connection_lost("send_failed");
                    }
                }
                _ = next_tick(&mut keepalive) => {
                    if send_client_message(&mut socket, &ClientMessage::Ping).await.is_err() {
                        return self.connection_lost("ping_failed");
                    }
                }
                maybe_inbound = socket.next() => {
                    match maybe_inbound {
                        Some(Ok(Message::Text(text))) => self.deliver_frame(text.as_str()),
                        Some(Ok(Message::Ping(payload))) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                return self.connection_lost("pong_failed");
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return self.connection_lost("closed_by_peer");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(event = "stream_transport_error", error = %err);
                            return self.connection_lost("transport_error");
                        }
                    }
                }
            }
        }
    }

    fn connection_lost(&self, reason: &'static str) -> SessionOutcome {
        self.link.connection_lost();
        info!(event = "stream_connection_lost", reason);
        SessionOutcome::Lost
    }

    async fn reconnect(&self) -> Option<Handshake> {
        let policy = &self.options.reconnect;
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let delay = policy.delay_for_attempt(attempt);
            if !self.link.set_reconnecting(attempt) {
                return None;
            }
            info!(
                event = "stream_reconnect_scheduled",
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64
            );
            let _ = self
                .events
                .send(ConnectionEvent::Reconnecting { attempt, delay });

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = async {
                    tokio::time::sleep(delay).await;
                    open_session(&self.url, self.options.handshake_timeout).await
                } => result,
            };

            match result {
                Ok(handshake) => return Some(handshake),
                Err(err) => warn!(event = "stream_reconnect_failed", attempt, error = %err),
            }
        }

        if self.link.fail() {
            warn!(event = "stream_connection_failed", attempts = max_attempts);
            let _ = self.events.send(ConnectionEvent::ConnectionFailed {
                attempts: max_attempts,
            });
        }
        None
    }

    fn deliver_frame(&self, text: &str) {
        match ServerEvent::from_text(text) {
            Ok(event) => self.deliver(&event),
            Err(err) => warn!(
                event = "stream_frame_dropped",
                error = %err,
                frame_len = text.len()
            ),
        }
    }

    fn deliver(&self, event: &ServerEvent) {
        self.tracker.apply(event);
        self.router.dispatch(event);
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn open_session(
    url: &str,
    handshake_timeout: Duration,
) -> Result<Handshake, StreamClientError> {
    let handshake = async {
        let (mut socket, _) = connect_async(url).await?;
        let (client_id, event) = recv_connection_established(&mut socket).await?;
        Ok::<_, StreamClientError>(Handshake {
            socket,
            client_id,
            event,
        })
    };

    match with_timeout(handshake_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(StreamClientError::HandshakeTimeout(handshake_timeout)),
    }
}

async fn recv_connection_established(
    socket: &mut Socket,
) -> Result<(String, ServerEvent), StreamClientError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => match ServerEvent::from_text(text.as_str()) {
                Ok(event) => {
                    if let ServerEvent::ConnectionEstablished { client_id, .. } = &event {
                        return Ok((client_id.clone(), event));
                    }
                    debug!(
                        event = "stream_pre_handshake_event_ignored",
                        kind = event.type_name()
                    );
                }
                Err(err) => warn!(event = "stream_frame_dropped", error = %err),
            },
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Close(_))) => {
                return Err(StreamClientError::Protocol(
                    "socket closed before connection_established".to_string(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(StreamClientError::WebSocket(err)),
            None => {
                return Err(StreamClientError::Protocol(
                    "socket ended before connection_established".to_string(),
                ));
            }
        }
    }
}

async fn send_client_message(
    socket: &mut Socket,
    message: &ClientMessage,
) -> Result<(), StreamClientError> {
    let text = message.to_text()?;
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}
