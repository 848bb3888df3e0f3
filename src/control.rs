//! HTTP client for the streaming service's control plane.
//!
//! Every call is a single request. Failures are returned as
//! [`ControlApiError`] and never retried here; wrap calls in
//! [`retry_async`](crate::retry::retry_async) with
//! [`ControlApiError::is_retryable`] to opt in.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::stream::proto::{ClientMessage, SessionInfo};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Default base URL of the service.
pub const CONTROL_API_BASE_URL: &str = "http://localhost:8000";
/// Path prefix of the streaming routes.
pub const STREAM_API_PREFIX: &str = "/api/v1/stream";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ControlApiDefaults;

impl ControlApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_EPISODES: u32 = 100;
    pub const NUM_EPISODES: u32 = 10;
    pub const LOOKAHEAD_DEPTH: u32 = 2;
    pub const MAX_LOOKAHEAD_DEPTH: u32 = 5;
}

#[derive(Clone, Debug)]
pub struct ControlApiClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ControlApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ControlApiDefaults::CONNECT_TIMEOUT,
            request_timeout: ControlApiDefaults::REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControlApiClient {
    http: Client,
    base_url: String,
    request_timeout: Duration,
}

impl ControlApiClient {
    pub fn new() -> Result<Self, ControlApiError> {
        Self::with_options(ControlApiClientOptions::default())
    }

    pub fn with_options(options: ControlApiClientOptions) -> Result<Self, ControlApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ControlApiError::Transport)?;

        Ok(Self {
            http,
            base_url: CONTROL_API_BASE_URL.to_string(),
            request_timeout: options.request_timeout,
        })
    }

    /// Points the client at another deployment, e.g. `http://127.0.0.1:9000`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim_end().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /start`. Validates `request` before sending.
    pub async fn start_comparison(
        &self,
        request: &StreamComparisonRequest,
    ) -> Result<StartComparisonResponse, ControlApiError> {
        request.validate()?;
        let response: StartComparisonResponse = self
            .execute(
                self.request(Method::POST, "/start").json(request),
                None,
            )
            .await?;

        if !response.success {
            return Err(ControlApiError::Rejected {
                message: response.message,
            });
        }
        if response.session_id.is_empty() {
            return Err(ControlApiError::Parse(
                "start response is missing session_id".to_string(),
            ));
        }
        Ok(response)
    }

    /// `GET /sessions/{id}`.
    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo, ControlApiError> {
        let path = session_path(session_id, "")?;
        self.execute(
            self.request(Method::GET, &path),
            Some(format!("session {session_id}")),
        )
        .await
    }

    /// `GET /sessions`.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ControlApiError> {
        self.execute(self.request(Method::GET, "/sessions"), None)
            .await
    }

    /// `POST /sessions/{id}/cancel`. The service answers 404 both for unknown
    /// sessions and for sessions that are no longer running.
    pub async fn cancel_session(&self, session_id: &str) -> Result<AckResponse, ControlApiError> {
        let path = session_path(session_id, "/cancel")?;
        let ack: AckResponse = self
            .execute(
                self.request(Method::POST, &path),
                Some(format!("running session {session_id}")),
            )
            .await?;
        ack.into_result()
    }

    /// `GET /health`. An unhealthy service still answers 200; check
    /// [`HealthCheck::is_healthy`].
    pub async fn health(&self) -> Result<HealthCheck, ControlApiError> {
        self.execute(self.request(Method::GET, "/health"), None)
            .await
    }

    /// `GET /stats`.
    pub async fn stats(&self) -> Result<StreamStats, ControlApiError> {
        self.execute(self.request(Method::GET, "/stats"), None)
            .await
    }

    /// `POST /cleanup`: drops finished tasks and idle connections server-side.
    pub async fn cleanup(&self) -> Result<AckResponse, ControlApiError> {
        let ack: AckResponse = self
            .execute(self.request(Method::POST, "/cleanup"), None)
            .await?;
        ack.into_result()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, STREAM_API_PREFIX, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.endpoint(path))
            .timeout(self.request_timeout)
    }

    async fn execute<T>(
        &self,
        builder: RequestBuilder,
        not_found: Option<String>,
    ) -> Result<T, ControlApiError>
    where
        T: DeserializeOwned,
    {
        let response = builder.send().await.map_err(ControlApiError::Transport)?;
        let status = response.status();
        let url = response.url().path().to_string();
        let body = response.text().await.map_err(ControlApiError::Transport)?;
        debug!(event = "control_api_response", path = %url, status = status.as_u16());

        if status == StatusCode::NOT_FOUND {
            if let Some(resource) = not_found {
                return Err(ControlApiError::NotFound { resource });
            }
        }
        if !status.is_success() {
            return Err(ControlApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|err| ControlApiError::Parse(err.to_string()))
    }
}

fn session_path(session_id: &str, suffix: &str) -> Result<String, ControlApiError> {
    if session_id.trim().is_empty() || session_id.contains(['/', '?', '#']) {
        return Err(ControlApiError::InvalidRequest(format!(
            "invalid session id {session_id:?}"
        )));
    }
    Ok(format!("/sessions/{session_id}{suffix}"))
}

/// Agents the service can run against an instance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Hybrid,
    Lookahead,
    /// Requires [`StreamComparisonRequest::controller_name`].
    Controller,
}

/// Classic dispatching heuristics used as comparison baselines.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum DispatchingRule {
    Spt,
    Fifo,
    Mwr,
    Lwr,
    Mor,
    Lor,
    Cr,
}

/// Body of `POST /start`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamComparisonRequest {
    pub instance_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_name: Option<String>,
    pub agents: Vec<AgentKind>,
    #[serde(default)]
    pub dispatching_rules: Vec<DispatchingRule>,
    pub num_episodes: u32,
    pub include_random_baseline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookahead_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_people: Option<u32>,
}

impl StreamComparisonRequest {
    /// Request with the service defaults: the hybrid agent, ten episodes and a
    /// random baseline.
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            controller_name: None,
            agents: vec![AgentKind::Hybrid],
            dispatching_rules: Vec::new(),
            num_episodes: ControlApiDefaults::NUM_EPISODES,
            include_random_baseline: true,
            lookahead_depth: Some(ControlApiDefaults::LOOKAHEAD_DEPTH),
            num_people: None,
        }
    }

    pub fn with_agents(mut self, agents: impl IntoIterator<Item = AgentKind>) -> Self {
        self.agents = agents.into_iter().collect();
        self
    }

    pub fn with_dispatching_rules(
        mut self,
        rules: impl IntoIterator<Item = DispatchingRule>,
    ) -> Self {
        self.dispatching_rules = rules.into_iter().collect();
        self
    }

    pub fn with_num_episodes(mut self, num_episodes: u32) -> Self {
        self.num_episodes = num_episodes;
        self
    }

    pub fn with_controller(mut self, controller_name: impl Into<String>) -> Self {
        self.controller_name = Some(controller_name.into());
        self
    }

    pub fn with_num_people(mut self, num_people: u32) -> Self {
        self.num_people = Some(num_people);
        self
    }

    pub fn with_lookahead_depth(mut self, depth: u32) -> Self {
        self.lookahead_depth = Some(depth);
        self
    }

    pub fn with_random_baseline(mut self, include: bool) -> Self {
        self.include_random_baseline = include;
        self
    }

    /// Applies the service's own request constraints locally.
    pub fn validate(&self) -> Result<(), ControlApiError> {
        if self.instance_name.trim().is_empty() {
            return Err(invalid("instance_name must not be empty"));
        }
        if !(1..=ControlApiDefaults::MAX_EPISODES).contains(&self.num_episodes) {
            return Err(invalid(format!(
                "num_episodes must be within 1..={}",
                ControlApiDefaults::MAX_EPISODES
            )));
        }
        if let Some(depth) = self.lookahead_depth {
            if !(1..=ControlApiDefaults::MAX_LOOKAHEAD_DEPTH).contains(&depth) {
                return Err(invalid(format!(
                    "lookahead_depth must be within 1..={}",
                    ControlApiDefaults::MAX_LOOKAHEAD_DEPTH
                )));
            }
        }
        let needs_controller = self.agents.contains(&AgentKind::Controller);
        let has_controller = self
            .controller_name
            .as_deref()
            .is_some_and(|name| !name.trim().is_empty());
        if needs_controller && !has_controller {
            return Err(invalid("controller agent requires controller_name"));
        }
        if self.agents.is_empty()
            && self.dispatching_rules.is_empty()
            && !self.include_random_baseline
        {
            return Err(invalid("request selects no method to compare"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ControlApiError {
    ControlApiError::InvalidRequest(message.into())
}

/// Response of `POST /start`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StartComparisonResponse {
    pub success: bool,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub message: String,
    /// Path of the websocket endpoint relative to the service root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_message: Option<ClientMessage>,
}

/// `{success, message}` envelope returned by cancel and cleanup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl AckResponse {
    fn into_result(self) -> Result<Self, ControlApiError> {
        if self.success {
            Ok(self)
        } else {
            Err(ControlApiError::Rejected {
                message: self.message,
            })
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_connections: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub status: String,
    /// ISO-8601 time of the check, as reported by the service.
    pub timestamp: String,
    pub active_connections: u64,
    pub active_sessions: u64,
    pub uptime_seconds: f64,
}

impl HealthCheck {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }
}

#[derive(Debug, Error)]
pub enum ControlApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    /// The service answered with `success: false`.
    #[error("request rejected: {message}")]
    Rejected { message: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ControlApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::NotFound { .. }
            | Self::Rejected { .. }
            | Self::Parse(_)
            | Self::InvalidRequest(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        match parsed.detail {
            Some(Value::String(detail)) => return detail,
            Some(Value::Array(items)) => {
                let messages: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(Value::as_str))
                    .collect();
                if !messages.is_empty() {
                    return messages.join("; ");
                }
            }
            _ => {}
        }
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{
        summarize_error_body, AgentKind, ControlApiClient, ControlApiError, DispatchingRule,
        StartComparisonResponse, StreamComparisonRequest, CONTROL_API_BASE_URL,
    };
    use crate::stream::proto::ClientMessage;

    #[test]
    fn request_serializes_service_contract() {
        let request = StreamComparisonRequest::new("ta01")
            .with_agents([AgentKind::Hybrid, AgentKind::Lookahead])
            .with_dispatching_rules([DispatchingRule::Spt, DispatchingRule::Fifo])
            .with_num_episodes(3);

        let value = serde_json::to_value(&request).expect("serialize request");
        assert_eq!(
            value,
            json!({
                "instance_name": "ta01",
                "agents": ["hybrid", "lookahead"],
                "dispatching_rules": ["SPT", "FIFO"],
                "num_episodes": 3,
                "include_random_baseline": true,
                "lookahead_depth": 2
            })
        );
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let base = StreamComparisonRequest::new("ta01");
        assert!(base.validate().is_ok());
        assert!(base.clone().with_num_episodes(0).validate().is_err());
        assert!(base.clone().with_num_episodes(101).validate().is_err());
        assert!(base.clone().with_lookahead_depth(6).validate().is_err());
        assert!(StreamComparisonRequest::new("  ").validate().is_err());
    }

    #[test]
    fn controller_agent_requires_controller_name() {
        let request = StreamComparisonRequest::new("ta01").with_agents([AgentKind::Controller]);
        assert!(matches!(
            request.validate(),
            Err(ControlApiError::InvalidRequest(_))
        ));
        assert!(request.with_controller("ctrl_v2").validate().is_ok());
    }

    #[test]
    fn request_without_methods_is_rejected() {
        let request = StreamComparisonRequest::new("ta01")
            .with_agents(Vec::new())
            .with_random_baseline(false);
        assert!(request.validate().is_err());
    }

    #[test]
    fn start_response_carries_subscribe_hint() {
        let response: StartComparisonResponse = serde_json::from_value(json!({
            "success": true,
            "session_id": "sid-1",
            "message": "Streaming comparison started",
            "websocket_url": "/api/v1/stream/ws",
            "subscribe_message": {"type": "subscribe", "session_id": "sid-1"}
        }))
        .expect("parse");

        assert_eq!(
            response.subscribe_message,
            Some(ClientMessage::subscribe("sid-1"))
        );
    }

    #[test]
    fn error_body_prefers_fastapi_detail() {
        assert_eq!(
            summarize_error_body(r#"{"detail":"Instance 'x' not found"}"#),
            "Instance 'x' not found"
        );
        assert_eq!(
            summarize_error_body(
                r#"{"detail":[{"loc":["body","num_episodes"],"msg":"ensure this value is less than or equal to 100"}]}"#
            ),
            "ensure this value is less than or equal to 100"
        );
        let long = "x".repeat(500);
        assert_eq!(summarize_error_body(&long).len(), 220);
    }

    #[test]
    fn retryable_classification() {
        let server_error = ControlApiError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        let throttled = ControlApiError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let bad_request = ControlApiError::HttpStatus {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        };
        assert!(server_error.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(!ControlApiError::NotFound {
            resource: "session x".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn base_url_override_is_normalized() {
        let client = ControlApiClient::new().expect("build client");
        assert_eq!(client.base_url(), CONTROL_API_BASE_URL);

        let client = client.with_base_url("http://127.0.0.1:9000/ \n");
        assert_eq!(client.base_url(), "http://127.0.0.1:9000");
        assert_eq!(
            client.endpoint("/health"),
            "http://127.0.0.1:9000/api/v1/stream/health"
        );
    }

    #[tokio::test]
    async fn malformed_session_ids_fail_locally() {
        let client = ControlApiClient::new().expect("build client");
        assert!(matches!(
            client.session_info("a/b").await,
            Err(ControlApiError::InvalidRequest(_))
        ));
        assert!(matches!(
            client.cancel_session("").await,
            Err(ControlApiError::InvalidRequest(_))
        ));
    }
}
