//! Subscription intent for comparison sessions.
//!
//! The registry remembers which sessions the consumer wants events for. It
//! does not know whether those sessions exist; the server is authoritative for
//! that. Every id in the set is re-subscribed each time the stream worker
//! completes a handshake.

use crate::stream::state::Link;

/// Cloneable handle over the set of subscribed session ids.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    link: Link,
}

impl SessionRegistry {
    pub(crate) fn new(link: Link) -> Self {
        Self { link }
    }

    /// Adds `session_id` to the set and sends a subscribe command when
    /// connected.
    ///
    /// Returns true when the command was handed to the live connection.
    /// Subscribing to an id already in the set only re-sends the command.
    pub fn subscribe(&self, session_id: impl Into<String>) -> bool {
        self.link.subscribe(session_id.into())
    }

    /// Removes `session_id` from the set and sends an unsubscribe command when
    /// connected.
    pub fn unsubscribe(&self, session_id: &str) -> bool {
        self.link.unsubscribe(session_id)
    }

    /// Sorted snapshot of the subscribed ids.
    pub fn subscribed(&self) -> Vec<String> {
        self.link.subscribed()
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.link.is_subscribed(session_id)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::SessionRegistry;
    use crate::stream::client::StreamClientError;
    use crate::stream::proto::ClientMessage;
    use crate::stream::state::{ConnectionState, Link};

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn subscribe_while_disconnected_only_records_intent() {
        let link = Link::new();
        let registry = SessionRegistry::new(link.clone());

        assert!(!registry.subscribe("sid-1"));
        assert!(registry.is_subscribed("sid-1"));
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn handshake_snapshot_contains_pending_subscriptions() {
        let link = Link::new();
        let registry = SessionRegistry::new(link.clone());
        registry.subscribe("b");
        registry.subscribe("a");
        registry.subscribe("c");
        registry.unsubscribe("c");

        let (tx, _rx) = mpsc::unbounded_channel();
        let replay = link.establish("client-1", tx).expect("link open");

        assert_eq!(replay, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(link.client_id().as_deref(), Some("client-1"));
    }

    #[test]
    fn commands_flow_only_while_connected() {
        let link = Link::new();
        let registry = SessionRegistry::new(link.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.establish("client-1", tx);

        assert!(registry.subscribe("sid-1"));
        assert!(registry.unsubscribe("sid-1"));
        assert_eq!(
            drain(&mut rx),
            vec![
                ClientMessage::subscribe("sid-1"),
                ClientMessage::unsubscribe("sid-1"),
            ]
        );

        link.connection_lost();
        assert!(!registry.subscribe("sid-2"));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.subscribed(), vec!["sid-2".to_string()]);
    }

    #[test]
    fn repeated_subscribe_keeps_one_entry_and_resends() {
        let link = Link::new();
        let registry = SessionRegistry::new(link.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.establish("client-1", tx);

        registry.subscribe("sid-1");
        registry.subscribe("sid-1");
        registry.unsubscribe("missing");

        assert_eq!(registry.subscribed(), vec!["sid-1".to_string()]);
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[test]
    fn closed_link_refuses_handshake_and_connect() {
        let link = Link::new();
        assert!(link.close());
        assert!(!link.close());

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(link.establish("client-1", tx).is_none());
        assert!(matches!(link.begin_connect(), Err(StreamClientError::Closed)));
        assert!(!link.set_reconnecting(1));
        assert_eq!(link.state(), ConnectionState::Closed);
    }

    #[test]
    fn begin_connect_rejects_concurrent_attempts() {
        let link = Link::new();
        assert!(matches!(link.begin_connect(), Ok(None)));
        assert!(matches!(
            link.begin_connect(),
            Err(StreamClientError::AlreadyConnecting)
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        link.establish("client-7", tx);
        assert_eq!(
            link.begin_connect().expect("connected").as_deref(),
            Some("client-7")
        );
    }

    #[test]
    fn send_requires_live_connection() {
        let link = Link::new();
        assert!(matches!(
            link.send(ClientMessage::Ping),
            Err(StreamClientError::NotConnected)
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        link.establish("client-1", tx);
        drop(rx);
        assert!(matches!(
            link.send(ClientMessage::Ping),
            Err(StreamClientError::SendQueueClosed)
        ));
    }
}
