//! Client-side cache of comparison session records.
//!
//! `SessionTracker` folds stream events and control-plane snapshots into one
//! [`SessionRecord`] per session id while enforcing the session state machine:
//! terminal statuses are sticky and progress never moves backwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::stream::proto::{MethodSummary, ServerEvent, SessionInfo, SessionStatus};

/// Session-scoped failure reported by the service through an `error` event.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct ApplicationError {
    pub session_id: Option<String>,
    pub message: String,
    pub details: Option<Value>,
    pub method_name: Option<String>,
    pub episode: Option<u32>,
    pub timestamp: String,
}

impl ApplicationError {
    /// Extracts the error payload from an `error` event.
    pub fn from_event(event: &ServerEvent) -> Option<Self> {
        match event {
            ServerEvent::Error {
                session_id,
                error_message,
                error_details,
                method_name,
                episode,
                timestamp,
            } => Some(Self {
                session_id: session_id.clone(),
                message: error_message.clone(),
                details: error_details.clone(),
                method_name: method_name.clone(),
                episode: *episode,
                timestamp: timestamp.clone(),
            }),
            _ => None,
        }
    }
}

/// Cached view of one session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRecord {
    /// Latest snapshot, with status and progress maintained locally.
    pub info: SessionInfo,
    pub total_methods: Option<u32>,
    pub episodes_per_method: Option<u32>,
    pub completed_methods: u32,
    pub current_method: Option<String>,
    /// Method name to summary metrics.
    pub results: BTreeMap<String, MethodSummary>,
    pub last_error: Option<ApplicationError>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::from_info(SessionInfo::pending(session_id))
    }

    fn from_info(info: SessionInfo) -> Self {
        let mut record = Self {
            info,
            total_methods: None,
            episodes_per_method: None,
            completed_methods: 0,
            current_method: None,
            results: BTreeMap::new(),
            last_error: None,
        };
        record.info.progress = record.info.progress.clamp(0.0, 1.0);
        if record.info.status == SessionStatus::Completed {
            record.info.progress = 1.0;
        }
        record
    }

    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.info.status
    }

    pub fn progress(&self) -> f64 {
        self.info.progress
    }

    pub fn is_terminal(&self) -> bool {
        self.info.status.is_terminal()
    }

    /// Moves to `next` if the state machine allows it. Completion reached
    /// straight from `initializing` is accepted as passing through `running`.
    fn set_status(&mut self, next: SessionStatus) -> bool {
        let current = self.info.status;
        if current == next {
            return true;
        }
        let legal = current.can_transition_to(next)
            || (current == SessionStatus::Initializing && next == SessionStatus::Completed);
        if !legal {
            debug!(
                event = "session_transition_ignored",
                session_id = %self.info.session_id,
                from = %current,
                to = %next
            );
            return false;
        }
        if next == SessionStatus::Completed {
            self.info.progress = 1.0;
        }
        self.info.status = next;
        true
    }

    fn start_running(&mut self) {
        if self.info.status == SessionStatus::Initializing {
            self.info.status = SessionStatus::Running;
        }
    }

    fn advance_progress(&mut self, value: f64) {
        if self.is_terminal() || !value.is_finite() {
            return;
        }
        let value = value.clamp(0.0, 1.0);
        if value > self.info.progress {
            self.info.progress = value;
        }
    }

    fn record_episode(&mut self, episode: u32, episodes_done: u32) {
        if self.is_terminal() {
            return;
        }
        self.start_running();
        self.info.current_episode = episode;

        let progress = match (self.total_methods, self.episodes_per_method) {
            (Some(methods), Some(per_method)) if methods > 0 && per_method > 0 => {
                let done = u64::from(self.completed_methods.min(methods)) * u64::from(per_method)
                    + u64::from(episodes_done.min(per_method));
                done as f64 / (u64::from(methods) * u64::from(per_method)) as f64
            }
            _ if self.info.total_episodes > 0 => {
                f64::from(episodes_done) / f64::from(self.info.total_episodes)
            }
            _ => return,
        };
        self.advance_progress(progress);
    }

    fn merge_snapshot(&mut self, info: &SessionInfo) {
        self.info.subscriber_count = info.subscriber_count;
        if self.info.created_at.is_none() {
            self.info.created_at = info.created_at.clone();
        }
        if self.info.request_data.is_null() {
            self.info.request_data = info.request_data.clone();
        }
        if self.is_terminal() {
            return;
        }

        if info.total_episodes > 0 {
            self.info.total_episodes = info.total_episodes;
        }
        self.info.current_episode = self.info.current_episode.max(info.current_episode);
        if info.error_message.is_some() {
            self.info.error_message = info.error_message.clone();
        }
        self.advance_progress(info.progress);
        self.set_status(info.status);
    }

    fn complete_with(&mut self, results: &BTreeMap<String, Value>) {
        if self.is_terminal() {
            return;
        }
        let mut parsed = BTreeMap::new();
        for (method, value) in results {
            if method.starts_with('_') {
                continue;
            }
            if !value.is_object() {
                warn!(
                    event = "session_result_skipped",
                    session_id = %self.info.session_id,
                    method = %method
                );
                continue;
            }
            match serde_json::from_value::<MethodSummary>(value.clone()) {
                Ok(summary) => {
                    parsed.insert(method.clone(), summary);
                }
                Err(err) => warn!(
                    event = "session_result_skipped",
                    session_id = %self.info.session_id,
                    method = %method,
                    error = %err
                ),
            }
        }
        self.results = parsed;
        self.current_method = None;
        self.set_status(SessionStatus::Completed);
    }
}

/// Shared, cloneable cache of session records keyed by session id.
#[derive(Clone, Debug)]
pub struct SessionTracker {
    records: Arc<RwLock<HashMap<String, SessionRecord>>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            records: Arc::default(),
            revision: Arc::new(revision),
        }
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver that is marked changed after every cache mutation.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SessionRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds one stream event into the cache.
    ///
    /// Returns the updated record for session-scoped events, `None` for
    /// events that touch no session.
    pub fn apply(&self, event: &ServerEvent) -> Option<SessionRecord> {
        match event {
            ServerEvent::SessionCreated { session, .. }
            | ServerEvent::SessionSubscribed { session, .. }
            | ServerEvent::SessionStatusUpdate { session, .. } => {
                Some(self.apply_snapshot(session))
            }
            ServerEvent::SessionsList { sessions, .. } => {
                for session in sessions {
                    self.apply_snapshot(session);
                }
                None
            }
            ServerEvent::ComparisonStart {
                session_id,
                total_methods,
                total_episodes_per_method,
                ..
            } => Some(self.update(session_id, |record| {
                if record.is_terminal() {
                    return;
                }
                record.start_running();
                record.total_methods = Some(*total_methods);
                record.episodes_per_method = Some(*total_episodes_per_method);
                if record.info.total_episodes == 0 {
                    record.info.total_episodes =
                        total_methods.saturating_mul(*total_episodes_per_method);
                }
            })),
            ServerEvent::ComparisonProgress {
                session_id,
                completed_methods,
                total_methods,
                current_method,
                progress,
                ..
            } => Some(self.update(session_id, |record| {
                if record.is_terminal() {
                    return;
                }
                record.start_running();
                record.completed_methods = record.completed_methods.max(*completed_methods);
                if *total_methods > 0 {
                    record.total_methods = Some(*total_methods);
                }
                if current_method.is_some() {
                    record.current_method = current_method.clone();
                }
                record.advance_progress(*progress);
            })),
            ServerEvent::MethodStart {
                session_id,
                method_name,
                ..
            } => Some(self.update(session_id, |record| {
                if record.is_terminal() {
                    return;
                }
                record.start_running();
                record.current_method = Some(method_name.clone());
            })),
            ServerEvent::EpisodeStart {
                session_id,
                episode,
                ..
            }
            | ServerEvent::EpisodeProgress {
                session_id,
                episode,
                ..
            } => Some(self.update(session_id, |record| {
                record.record_episode(*episode, episode.saturating_sub(1));
            })),
            ServerEvent::EpisodeComplete {
                session_id,
                episode,
                ..
            } => Some(self.update(session_id, |record| {
                record.record_episode(*episode, *episode);
            })),
            ServerEvent::MethodComplete {
                session_id,
                method_name,
                results,
                completed_methods,
                total_methods,
                ..
            } => Some(self.update(session_id, |record| {
                if record.is_terminal() {
                    return;
                }
                record.start_running();
                if let Ok(summary) = serde_json::from_value::<MethodSummary>(results.clone()) {
                    record.results.insert(method_name.clone(), summary);
                }
                record.completed_methods = record.completed_methods.max(*completed_methods);
                if *total_methods > 0 {
                    record.total_methods = Some(*total_methods);
                    record.advance_progress(
                        f64::from(*completed_methods) / f64::from(*total_methods),
                    );
                }
            })),
            ServerEvent::ComparisonComplete {
                session_id,
                results,
                ..
            } => Some(self.update(session_id, |record| record.complete_with(results))),
            ServerEvent::Error { session_id, .. } => {
                let session_id = session_id.as_deref()?;
                let error = ApplicationError::from_event(event)?;
                Some(self.update(session_id, |record| {
                    if !record.is_terminal() {
                        record.info.error_message = Some(error.message.clone());
                        record.set_status(SessionStatus::Failed);
                    }
                    record.last_error = Some(error);
                }))
            }
            ServerEvent::ConnectionEstablished { .. }
            | ServerEvent::SubscribeResponse { .. }
            | ServerEvent::UnsubscribeResponse { .. }
            | ServerEvent::Pong { .. }
            | ServerEvent::Unknown { .. } => None,
        }
    }

    /// Merges a full session snapshot, e.g. from the control API.
    pub fn apply_snapshot(&self, info: &SessionInfo) -> SessionRecord {
        let record = self
            .write()
            .entry(info.session_id.clone())
            .and_modify(|record| record.merge_snapshot(info))
            .or_insert_with(|| SessionRecord::from_info(info.clone()))
            .clone();
        self.bump();
        record
    }

    /// Inserts an `initializing` record carrying `request_data` unless the
    /// session is already known. An existing record only gains
    /// `request_data` if it had none.
    pub fn seed(&self, session_id: &str, request_data: Value) -> SessionRecord {
        self.update(session_id, |record| {
            if record.info.request_data.is_null() {
                record.info.request_data = request_data;
            }
        })
    }

    /// Marks a session cancelled if the state machine allows it.
    ///
    /// Returns whether the record now reports `cancelled`.
    pub fn mark_cancelled(&self, session_id: &str) -> bool {
        self.update(session_id, |record| {
            record.set_status(SessionStatus::Cancelled);
        })
        .status()
            == SessionStatus::Cancelled
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.read().get(session_id).cloned()
    }

    /// All records, ordered by session id.
    pub fn all(&self) -> Vec<SessionRecord> {
        let mut records: Vec<_> = self.read().values().cloned().collect();
        records.sort_by(|a, b| a.info.session_id.cmp(&b.info.session_id));
        records
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        let removed = self.write().remove(session_id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    pub fn clear(&self) {
        self.write().clear();
        self.bump();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn update<F>(&self, session_id: &str, apply: F) -> SessionRecord
    where
        F: FnOnce(&mut SessionRecord),
    {
        let record = {
            let mut records = self.write();
            let record = records
                .entry(session_id.to_string())
                .or_insert_with(|| SessionRecord::new(session_id));
            apply(record);
            record.clone()
        };
        self.bump();
        record
    }
}
