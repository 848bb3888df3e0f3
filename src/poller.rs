//! Control-plane-only session watcher for when no stream connection is
//! available.
//!
//! Snapshots go through the same [`SessionTracker`] as stream events, so the
//! session state machine and terminal semantics are identical in both modes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::control::{ControlApiClient, ControlApiError};
use crate::stream::proto::ServerEvent;
use crate::stream::router::EventRouter;
use crate::stream::session::{SessionRecord, SessionTracker};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollerDefaults;

impl PollerDefaults {
    pub const INTERVAL: Duration = Duration::from_secs(2);
}

#[derive(Debug, Error)]
pub enum PollError {
    /// Polling stops at the first control-plane failure.
    #[error(transparent)]
    Control(#[from] ControlApiError),

    #[error("polling cancelled")]
    Cancelled,
}

/// Periodically fetches session snapshots from the control API.
///
/// Each observed change of status or progress is dispatched through the
/// router, if one is attached, as a `session_status_update` event.
#[derive(Clone, Debug)]
pub struct SessionPoller {
    control: ControlApiClient,
    tracker: SessionTracker,
    router: Option<Arc<EventRouter>>,
    interval: Duration,
}

impl SessionPoller {
    pub fn new(control: ControlApiClient) -> Self {
        Self {
            control,
            tracker: SessionTracker::new(),
            router: None,
            interval: PollerDefaults::INTERVAL,
        }
    }

    pub fn with_tracker(mut self, tracker: SessionTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_router(mut self, router: Arc<EventRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// Fetches one snapshot and folds it into the tracker.
    pub async fn poll_once(&self, session_id: &str) -> Result<SessionRecord, PollError> {
        let info = self.control.session_info(session_id).await?;
        let before = self.tracker.get(session_id);
        let record = self.tracker.apply_snapshot(&info);

        let changed = before.map_or(true, |previous| {
            previous.status() != record.status() || previous.progress() != record.progress()
        });
        if changed {
            debug!(
                event = "session_poll_changed",
                session_id,
                status = %record.status(),
                progress = record.progress()
            );
            if let Some(router) = self.router.as_ref() {
                router.dispatch(&status_update(&record));
            }
        }
        Ok(record)
    }

    /// Polls until the session reaches a terminal status.
    pub async fn poll_until_terminal(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionRecord, PollError> {
        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                result = self.poll_once(session_id) => result?,
            };
            if record.is_terminal() {
                return Ok(record);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

fn status_update(record: &SessionRecord) -> ServerEvent {
    ServerEvent::SessionStatusUpdate {
        session_id: record.session_id().to_string(),
        status: record.status(),
        session: record.info.clone(),
        timestamp: Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::status_update;
    use crate::stream::proto::{EventKind, SessionStatus};
    use crate::stream::session::SessionRecord;

    #[test]
    fn synthetic_update_mirrors_record() {
        let mut record = SessionRecord::new("sid-1");
        record.info.status = SessionStatus::Running;
        record.info.progress = 0.5;

        let event = status_update(&record);
        assert_eq!(event.kind(), Some(EventKind::SessionStatusUpdate));
        assert_eq!(event.session_id(), Some("sid-1"));
        let timestamp = event.timestamp().expect("timestamp");
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }
}
