use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a comparison session.
///
/// `initializing -> running -> {completed | failed | cancelled}`; failure and
/// cancellation may also happen straight from `initializing`. Nothing leaves a
/// terminal status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true when `next` is a single legal step from `self`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Failed)
                | (Initializing, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session record as reported by the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_episode: u32,
    #[serde(default)]
    pub total_episodes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Parameters of the request that created the session.
    #[serde(default)]
    pub request_data: Value,
    #[serde(default)]
    pub subscriber_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SessionInfo {
    /// Returns an empty `initializing` record for `session_id`.
    pub fn pending(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Initializing,
            progress: 0.0,
            current_episode: 0,
            total_episodes: 0,
            created_at: None,
            request_data: Value::Null,
            subscriber_count: 0,
            error_message: None,
        }
    }
}

/// Per-method summary metrics reported in `method_complete` and
/// `comparison_complete` results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MethodSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episodes_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_makespan: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_makespan: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_makespan: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_makespan: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_reward: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_execution_time: Option<f64>,
    /// Fields this SDK does not model, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Commands sent from the client over the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { session_id: String },
    Unsubscribe { session_id: String },
    Ping,
    GetSessions,
}

impl ClientMessage {
    pub fn subscribe(session_id: impl Into<String>) -> Self {
        Self::Subscribe {
            session_id: session_id.into(),
        }
    }

    pub fn unsubscribe(session_id: impl Into<String>) -> Self {
        Self::Unsubscribe {
            session_id: session_id.into(),
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Discriminant of every event kind this SDK understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    ConnectionEstablished,
    SessionCreated,
    SessionSubscribed,
    SessionStatusUpdate,
    ComparisonStart,
    ComparisonProgress,
    ComparisonComplete,
    MethodStart,
    MethodComplete,
    EpisodeStart,
    EpisodeProgress,
    EpisodeComplete,
    Error,
    SubscribeResponse,
    UnsubscribeResponse,
    SessionsList,
    Pong,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        EventKind::ConnectionEstablished,
        EventKind::SessionCreated,
        EventKind::SessionSubscribed,
        EventKind::SessionStatusUpdate,
        EventKind::ComparisonStart,
        EventKind::ComparisonProgress,
        EventKind::ComparisonComplete,
        EventKind::MethodStart,
        EventKind::MethodComplete,
        EventKind::EpisodeStart,
        EventKind::EpisodeProgress,
        EventKind::EpisodeComplete,
        EventKind::Error,
        EventKind::SubscribeResponse,
        EventKind::UnsubscribeResponse,
        EventKind::SessionsList,
        EventKind::Pong,
    ];

    /// Wire value of the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "connection_established",
            Self::SessionCreated => "session_created",
            Self::SessionSubscribed => "session_subscribed",
            Self::SessionStatusUpdate => "session_status_update",
            Self::ComparisonStart => "comparison_start",
            Self::ComparisonProgress => "comparison_progress",
            Self::ComparisonComplete => "comparison_complete",
            Self::MethodStart => "method_start",
            Self::MethodComplete => "method_complete",
            Self::EpisodeStart => "episode_start",
            Self::EpisodeProgress => "episode_progress",
            Self::EpisodeComplete => "episode_complete",
            Self::Error => "error",
            Self::SubscribeResponse => "subscribe_response",
            Self::UnsubscribeResponse => "unsubscribe_response",
            Self::SessionsList => "sessions_list",
            Self::Pong => "pong",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events pushed by the streaming service.
///
/// Decode with [`ServerEvent::from_text`], which maps discriminants this SDK
/// does not know to [`ServerEvent::Unknown`] instead of failing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionEstablished {
        client_id: String,
        timestamp: String,
    },
    SessionCreated {
        session: SessionInfo,
        timestamp: String,
    },
    SessionSubscribed {
        session: SessionInfo,
        timestamp: String,
    },
    SessionStatusUpdate {
        session_id: String,
        status: SessionStatus,
        session: SessionInfo,
        timestamp: String,
    },
    ComparisonStart {
        session_id: String,
        total_methods: u32,
        total_episodes_per_method: u32,
        timestamp: String,
    },
    ComparisonProgress {
        session_id: String,
        #[serde(default, alias = "completed_agents")]
        completed_methods: u32,
        #[serde(default, alias = "total_agents")]
        total_methods: u32,
        #[serde(default, alias = "current_agent", skip_serializing_if = "Option::is_none")]
        current_method: Option<String>,
        #[serde(default)]
        progress: f64,
        timestamp: String,
    },
    ComparisonComplete {
        session_id: String,
        /// Method name to summary metrics. Keys starting with `_` carry
        /// service metadata rather than a method.
        results: BTreeMap<String, Value>,
        timestamp: String,
    },
    MethodStart {
        session_id: String,
        method_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method_type: Option<String>,
        #[serde(default)]
        completed_methods: u32,
        #[serde(default)]
        total_methods: u32,
        timestamp: String,
    },
    MethodComplete {
        session_id: String,
        method_name: String,
        #[serde(default)]
        results: Value,
        completed_methods: u32,
        total_methods: u32,
        timestamp: String,
    },
    EpisodeStart {
        session_id: String,
        episode: u32,
        agent_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_episodes: Option<u32>,
        timestamp: String,
    },
    EpisodeProgress {
        session_id: String,
        episode: u32,
        agent_name: String,
        step: u32,
        action: i64,
        reward: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_reward: Option<f64>,
        #[serde(default, alias = "makespan", skip_serializing_if = "Option::is_none")]
        current_makespan: Option<f64>,
        timestamp: String,
    },
    EpisodeComplete {
        session_id: String,
        episode: u32,
        agent_name: String,
        makespan: f64,
        total_reward: f64,
        execution_time: f64,
        timestamp: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_details: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        episode: Option<u32>,
        timestamp: String,
    },
    SubscribeResponse {
        session_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    UnsubscribeResponse {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    SessionsList {
        sessions: Vec<SessionInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Pong {
        timestamp: String,
    },
    /// Event with a discriminant this SDK does not model. `payload` is the
    /// frame exactly as received.
    #[serde(skip)]
    Unknown { kind: String, payload: Value },
}

impl ServerEvent {
    /// Decodes one text frame.
    ///
    /// Fails only for frames that are not JSON objects with a string `type`,
    /// or whose known discriminant carries a malformed body.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => return Err(<serde_json::Error as serde::de::Error>::missing_field("type")),
        };

        if EventKind::parse(&kind).is_some() {
            serde_json::from_value(value)
        } else {
            Ok(Self::Unknown {
                kind,
                payload: value,
            })
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Unknown { payload, .. } => serde_json::to_string(payload),
            _ => serde_json::to_string(self),
        }
    }

    /// Returns the discriminant, or `None` for [`ServerEvent::Unknown`].
    pub fn kind(&self) -> Option<EventKind> {
        let kind = match self {
            Self::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            Self::SessionCreated { .. } => EventKind::SessionCreated,
            Self::SessionSubscribed { .. } => EventKind::SessionSubscribed,
            Self::SessionStatusUpdate { .. } => EventKind::SessionStatusUpdate,
            Self::ComparisonStart { .. } => EventKind::ComparisonStart,
            Self::ComparisonProgress { .. } => EventKind::ComparisonProgress,
            Self::ComparisonComplete { .. } => EventKind::ComparisonComplete,
            Self::MethodStart { .. } => EventKind::MethodStart,
            Self::MethodComplete { .. } => EventKind::MethodComplete,
            Self::EpisodeStart { .. } => EventKind::EpisodeStart,
            Self::EpisodeProgress { .. } => EventKind::EpisodeProgress,
            Self::EpisodeComplete { .. } => EventKind::EpisodeComplete,
            Self::Error { .. } => EventKind::Error,
            Self::SubscribeResponse { .. } => EventKind::SubscribeResponse,
            Self::UnsubscribeResponse { .. } => EventKind::UnsubscribeResponse,
            Self::SessionsList { .. } => EventKind::SessionsList,
            Self::Pong { .. } => EventKind::Pong,
            Self::Unknown { .. } => return None,
        };
        Some(kind)
    }

    /// Wire discriminant, including unknown ones.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Unknown { kind, .. } => kind,
            other => other.kind().map(EventKind::as_str).unwrap_or_default(),
        }
    }

    /// Session the event concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { session, .. } | Self::SessionSubscribed { session, .. } => {
                Some(&session.session_id)
            }
            Self::SessionStatusUpdate { session_id, .. }
            | Self::ComparisonStart { session_id, .. }
            | Self::ComparisonProgress { session_id, .. }
            | Self::ComparisonComplete { session_id, .. }
            | Self::MethodStart { session_id, .. }
            | Self::MethodComplete { session_id, .. }
            | Self::EpisodeStart { session_id, .. }
            | Self::EpisodeProgress { session_id, .. }
            | Self::EpisodeComplete { session_id, .. }
            | Self::SubscribeResponse { session_id, .. }
            | Self::UnsubscribeResponse { session_id, .. } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_deref(),
            Self::Unknown { payload, .. } => payload.get("session_id").and_then(Value::as_str),
            Self::ConnectionEstablished { .. } | Self::SessionsList { .. } | Self::Pong { .. } => {
                None
            }
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        match self {
            Self::ConnectionEstablished { timestamp, .. }
            | Self::SessionCreated { timestamp, .. }
            | Self::SessionSubscribed { timestamp, .. }
            | Self::SessionStatusUpdate { timestamp, .. }
            | Self::ComparisonStart { timestamp, .. }
            | Self::ComparisonProgress { timestamp, .. }
            | Self::ComparisonComplete { timestamp, .. }
            | Self::MethodStart { timestamp, .. }
            | Self::MethodComplete { timestamp, .. }
            | Self::EpisodeStart { timestamp, .. }
            | Self::EpisodeProgress { timestamp, .. }
            | Self::EpisodeComplete { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::Pong { timestamp } => Some(timestamp),
            Self::SubscribeResponse { timestamp, .. }
            | Self::UnsubscribeResponse { timestamp, .. }
            | Self::SessionsList { timestamp, .. } => timestamp.as_deref(),
            Self::Unknown { payload, .. } => payload.get("timestamp").and_then(Value::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscribe_command_wire_shape() {
        let text = ClientMessage::subscribe("sid-1").to_text().expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value, json!({"type": "subscribe", "session_id": "sid-1"}));

        let text = ClientMessage::Ping.to_text().expect("encode");
        assert_eq!(text, r#"{"type":"ping"}"#);
    }

    #[test]
    fn decodes_connection_established() {
        let event = ServerEvent::from_text(
            r#"{"type":"connection_established","client_id":"c-1","timestamp":"2024-05-01T10:00:00"}"#,
        )
        .expect("decode");
        assert_eq!(event.kind(), Some(EventKind::ConnectionEstablished));
        assert_eq!(event.timestamp(), Some("2024-05-01T10:00:00"));
        assert!(matches!(event, ServerEvent::ConnectionEstablished { ref client_id, .. } if client_id == "c-1"));
    }

    #[test]
    fn decodes_session_created_with_python_nulls() {
        let event = ServerEvent::from_value(json!({
            "type": "session_created",
            "timestamp": "2024-05-01T10:00:00.123456",
            "session": {
                "session_id": "sid-1",
                "status": "initializing",
                "progress": 0.0,
                "current_episode": 0,
                "total_episodes": 3,
                "created_at": "2024-05-01T10:00:00",
                "request_data": {"instance_name": "s1", "num_episodes": 3},
                "error_message": null,
                "subscriber_count": 0
            }
        }))
        .expect("decode");

        match event {
            ServerEvent::SessionCreated { session, .. } => {
                assert_eq!(session.session_id, "sid-1");
                assert_eq!(session.status, SessionStatus::Initializing);
                assert_eq!(session.total_episodes, 3);
                assert_eq!(session.error_message, None);
                assert_eq!(session.request_data["instance_name"], "s1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn comparison_progress_accepts_agent_field_names() {
        let event = ServerEvent::from_value(json!({
            "type": "comparison_progress",
            "session_id": "sid-1",
            "completed_agents": 1,
            "total_agents": 4,
            "current_agent": "SPT",
            "progress": 0.25,
            "timestamp": "t"
        }))
        .expect("decode");

        assert_eq!(
            event,
            ServerEvent::ComparisonProgress {
                session_id: "sid-1".to_string(),
                completed_methods: 1,
                total_methods: 4,
                current_method: Some("SPT".to_string()),
                progress: 0.25,
                timestamp: "t".to_string(),
            }
        );
    }

    #[test]
    fn unknown_kind_is_kept_verbatim() {
        let raw = json!({"type": "some_future_kind", "timestamp": "T", "nested": {"a": [1, 2]}});
        let event = ServerEvent::from_value(raw.clone()).expect("unknown kinds decode");

        assert_eq!(event.kind(), None);
        assert_eq!(event.type_name(), "some_future_kind");
        assert_eq!(event.timestamp(), Some("T"));
        assert_eq!(
            event,
            ServerEvent::Unknown {
                kind: "some_future_kind".to_string(),
                payload: raw.clone(),
            }
        );
        let text = event.to_text().expect("encode");
        assert_eq!(serde_json::from_str::<Value>(&text).expect("json"), raw);
    }

    #[test]
    fn frames_without_type_are_rejected() {
        assert!(ServerEvent::from_text(r#"{"timestamp":"T"}"#).is_err());
        assert!(ServerEvent::from_text(r#"[1,2,3]"#).is_err());
        assert!(ServerEvent::from_text(r#"{"type":7}"#).is_err());
        assert!(ServerEvent::from_text("not json").is_err());
    }

    #[test]
    fn known_kind_with_malformed_body_is_rejected() {
        let result = ServerEvent::from_text(
            r#"{"type":"episode_progress","session_id":"sid-1","timestamp":"T"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn episode_progress_optional_fields_and_extras() {
        let event = ServerEvent::from_value(json!({
            "type": "episode_progress",
            "session_id": "sid-1",
            "episode": 2,
            "agent_name": "A",
            "step": 15,
            "action": 3,
            "reward": -1.5,
            "makespan": null,
            "timestamp": "T"
        }))
        .expect("decode");

        match event {
            ServerEvent::EpisodeProgress {
                episode,
                step,
                total_reward,
                current_makespan,
                ..
            } => {
                assert_eq!(episode, 2);
                assert_eq!(step, 15);
                assert_eq!(total_reward, None);
                assert_eq!(current_makespan, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn episode_progress_reads_service_makespan_key() {
        let event = ServerEvent::from_value(json!({
            "type": "episode_progress",
            "session_id": "sid-1",
            "episode": 1,
            "agent_name": "A",
            "step": 4,
            "action": 0,
            "reward": -1.0,
            "makespan": 12.5,
            "timestamp": "T"
        }))
        .expect("decode");

        match &event {
            ServerEvent::EpisodeProgress {
                current_makespan, ..
            } => assert_eq!(*current_makespan, Some(12.5)),
            other => panic!("unexpected event: {other:?}"),
        }
        let encoded: serde_json::Value =
            serde_json::from_str(&event.to_text().expect("encode")).expect("json");
        assert_eq!(encoded["current_makespan"], 12.5);
    }

    #[test]
    fn error_event_session_scope() {
        let scoped = ServerEvent::from_value(json!({
            "type": "error",
            "session_id": "sid-9",
            "error_message": "Failed to create JSS environment",
            "error_details": {"instance_path": "/x"},
            "timestamp": "T"
        }))
        .expect("decode");
        assert_eq!(scoped.session_id(), Some("sid-9"));

        let global = ServerEvent::from_value(json!({
            "type": "error",
            "error_message": "Invalid JSON format",
            "timestamp": "T"
        }))
        .expect("decode");
        assert_eq!(global.session_id(), None);
    }

    #[test]
    fn subscribe_response_has_no_timestamp() {
        let event = ServerEvent::from_text(
            r#"{"type":"subscribe_response","success":false,"session_id":"missing"}"#,
        )
        .expect("decode");
        assert_eq!(event.timestamp(), None);
        assert_eq!(event.session_id(), Some("missing"));
    }

    #[test]
    fn event_kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("ping"), None);
    }

    #[test]
    fn status_transitions_follow_state_machine() {
        use SessionStatus::*;

        assert!(Initializing.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Initializing.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Initializing));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Initializing, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn method_summary_keeps_unmodeled_fields() {
        let summary: MethodSummary = serde_json::from_value(json!({
            "avg_makespan": 10.0,
            "best_makespan": 8.0,
            "episodes_completed": 3,
            "makespans": [10.0, 12.0, 8.0]
        }))
        .expect("decode");

        assert_eq!(summary.avg_makespan, Some(10.0));
        assert_eq!(summary.episodes_completed, Some(3));
        assert_eq!(summary.extra.get("makespans"), Some(&json!([10.0, 12.0, 8.0])));
    }
}
