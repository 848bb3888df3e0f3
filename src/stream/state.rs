//! Connection state shared between the stream worker and its handles.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::stream::client::StreamClientError;
use crate::stream::proto::ClientMessage;

/// Lifecycle state of a [`StreamClient`](crate::stream::client::StreamClient).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no connection attempt in progress.
    Disconnected,
    /// Initial connect in progress.
    Connecting,
    /// Handshake completed; commands flow to the server.
    Connected,
    /// Connection was lost; `attempt` is the 1-based reconnect attempt.
    Reconnecting { attempt: usize },
    /// `disconnect()` was called. Terminal.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug)]
struct LinkState {
    state: ConnectionState,
    client_id: Option<String>,
    /// Command channel of the live connection. Present only while connected.
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    subscribed: BTreeSet<String>,
}

/// Shared handle over connection state, the live command channel and the
/// subscribed set. All three change together under one lock so a handshake
/// snapshot and a concurrent subscribe can never interleave.
#[derive(Clone, Debug)]
pub(crate) struct Link {
    inner: Arc<Mutex<LinkState>>,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinkState {
                state: ConnectionState::Disconnected,
                client_id: None,
                outbound: None,
                subscribed: BTreeSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn client_id(&self) -> Option<String> {
        self.lock().client_id.clone()
    }

    /// Claims the right to start a connection.
    ///
    /// Returns `Some(client_id)` when already connected.
    pub(crate) fn begin_connect(&self) -> Result<Option<String>, StreamClientError> {
        let mut guard = self.lock();
        match guard.state {
            ConnectionState::Connected => Ok(guard.client_id.clone()),
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                Err(StreamClientError::AlreadyConnecting)
            }
            ConnectionState::Closed => Err(StreamClientError::Closed),
            ConnectionState::Disconnected => {
                guard.state = ConnectionState::Connecting;
                Ok(None)
            }
        }
    }

    /// Marks the link connected and returns the ids to replay.
    ///
    /// Returns `None` if the link was closed in the meantime.
    pub(crate) fn establish(
        &self,
        client_id: &str,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> Option<Vec<String>> {
        let mut guard = self.lock();
        if guard.state == ConnectionState::Closed {
            return None;
        }
        guard.state = ConnectionState::Connected;
        guard.client_id = Some(client_id.to_string());
        guard.outbound = Some(outbound);
        Some(guard.subscribed.iter().cloned().collect())
    }

    /// Drops the live channel after the transport went away.
    pub(crate) fn connection_lost(&self) {
        let mut guard = self.lock();
        guard.outbound = None;
        guard.client_id = None;
        if guard.state != ConnectionState::Closed {
            guard.state = ConnectionState::Disconnected;
        }
    }

    /// Returns false once the link is closed.
    pub(crate) fn set_reconnecting(&self, attempt: usize) -> bool {
        let mut guard = self.lock();
        if guard.state == ConnectionState::Closed {
            return false;
        }
        guard.state = ConnectionState::Reconnecting { attempt };
        true
    }

    /// Settles in `Disconnected` after a failed connect. Returns false once
    /// the link is closed.
    pub(crate) fn fail(&self) -> bool {
        let mut guard = self.lock();
        guard.outbound = None;
        guard.client_id = None;
        if guard.state == ConnectionState::Closed {
            return false;
        }
        guard.state = ConnectionState::Disconnected;
        true
    }

    /// Moves to `Closed`. Returns true only for the first call.
    pub(crate) fn close(&self) -> bool {
        let mut guard = self.lock();
        guard.outbound = None;
        guard.client_id = None;
        if guard.state == ConnectionState::Closed {
            return false;
        }
        guard.state = ConnectionState::Closed;
        true
    }

    /// Queues `message` on the live connection.
    pub(crate) fn send(&self, message: ClientMessage) -> Result<(), StreamClientError> {
        let guard = self.lock();
        match (&guard.state, &guard.outbound) {
            (ConnectionState::Connected, Some(tx)) => tx
                .send(message)
                .map_err(|_| StreamClientError::SendQueueClosed),
            _ => Err(StreamClientError::NotConnected),
        }
    }

    pub(crate) fn subscribe(&self, session_id: String) -> bool {
        let mut guard = self.lock();
        guard.subscribed.insert(session_id.clone());
        let sent = Self::send_locked(&guard, ClientMessage::subscribe(session_id.as_str()));
        debug!(event = "stream_subscribe", session_id = %session_id, sent);
        sent
    }

    pub(crate) fn unsubscribe(&self, session_id: &str) -> bool {
        let mut guard = self.lock();
        guard.subscribed.remove(session_id);
        let sent = Self::send_locked(&guard, ClientMessage::unsubscribe(session_id));
        debug!(event = "stream_unsubscribe", session_id, sent);
        sent
    }

    pub(crate) fn subscribed(&self) -> Vec<String> {
        self.lock().subscribed.iter().cloned().collect()
    }

    pub(crate) fn is_subscribed(&self, session_id: &str) -> bool {
        self.lock().subscribed.contains(session_id)
    }

    fn send_locked(guard: &LinkState, message: ClientMessage) -> bool {
        if guard.state != ConnectionState::Connected {
            return false;
        }
        guard
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }
}
