//! Demultiplexes decoded server events to consumer callbacks.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::stream::proto::{EventKind, ServerEvent};

/// Callback invoked for routed events. Runs on the stream worker task, so it
/// must return promptly.
pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Partial set of handlers applied with [`EventRouter::merge`].
///
/// Only the kinds named in the set (and the wildcard, if set) replace the
/// router's existing handlers.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<EventKind, EventHandler>,
    wildcard: Option<EventHandler>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn on_any<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.wildcard = Some(Arc::new(handler));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.wildcard.is_none()
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        f.debug_struct("HandlerSet")
            .field("kinds", &kinds)
            .field("wildcard", &self.wildcard.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Routes {
    handlers: HashMap<EventKind, EventHandler>,
    wildcard: Option<EventHandler>,
}

/// Registry of per-kind handlers plus one optional wildcard handler.
///
/// Each kind holds at most one handler; registering again replaces it.
#[derive(Default)]
pub struct EventRouter {
    routes: Mutex<Routes>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the handler for `kind`, replacing any previous one.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.lock().handlers.insert(kind, Arc::new(handler));
    }

    /// Registers the wildcard handler, which sees every event including kinds
    /// this SDK does not know.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.lock().wildcard = Some(Arc::new(handler));
    }

    /// Removes the handler for `kind`. Returns whether one was registered.
    pub fn off(&self, kind: EventKind) -> bool {
        self.lock().handlers.remove(&kind).is_some()
    }

    pub fn clear_wildcard(&self) -> bool {
        self.lock().wildcard.take().is_some()
    }

    /// Applies `set`, replacing only the handlers it names.
    pub fn merge(&self, set: HandlerSet) {
        let mut routes = self.lock();
        routes.handlers.extend(set.handlers);
        if let Some(wildcard) = set.wildcard {
            routes.wildcard = Some(wildcard);
        }
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.lock().handlers.contains_key(&kind)
    }

    pub fn has_wildcard(&self) -> bool {
        self.lock().wildcard.is_some()
    }

    /// Delivers `event` to its kind's handler, then to the wildcard.
    ///
    /// Returns how many handlers completed. Events with no matching handler
    /// are dropped. A panicking handler is logged and does not count; the
    /// remaining handlers still run.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let (specific, wildcard) = {
            let routes = self.lock();
            let specific = event
                .kind()
                .and_then(|kind| routes.handlers.get(&kind).cloned());
            (specific, routes.wildcard.clone())
        };

        [specific, wildcard]
            .into_iter()
            .flatten()
            .filter(|handler| invoke(handler, event))
            .count()
    }
}

fn invoke(handler: &EventHandler, event: &ServerEvent) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            warn!(
                event = "stream_handler_panicked",
                kind = event.type_name(),
                reason
            );
            false
        }
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.lock();
        let mut kinds: Vec<_> = routes.handlers.keys().copied().collect();
        kinds.sort();
        f.debug_struct("EventRouter")
            .field("kinds", &kinds)
            .field("wildcard", &routes.wildcard.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{EventRouter, HandlerSet};
    use crate::stream::proto::{EventKind, ServerEvent};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, label: &'static str) -> impl Fn(&ServerEvent) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |event: &ServerEvent| {
            log.lock()
                .expect("log")
                .push(format!("{label}:{}", event.type_name()));
        }
    }

    fn pong() -> ServerEvent {
        ServerEvent::Pong {
            timestamp: "T".to_string(),
        }
    }

    #[test]
    fn specific_handler_runs_before_wildcard() {
        let log = Log::default();
        let router = EventRouter::new();
        router.on_any(recorder(&log, "any"));
        router.on(EventKind::Pong, recorder(&log, "pong"));

        assert_eq!(router.dispatch(&pong()), 2);
        assert_eq!(
            *log.lock().expect("log"),
            vec!["pong:pong".to_string(), "any:pong".to_string()]
        );
    }

    #[test]
    fn unknown_kind_reaches_only_wildcard_unmodified() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = EventRouter::new();
        router.on(EventKind::Error, |_| panic!("error handler must not run"));
        {
            let seen = Arc::clone(&seen);
            router.on_any(move |event| seen.lock().expect("seen").push(event.clone()));
        }

        let raw = json!({"type": "some_future_kind", "timestamp": "T", "x": 1});
        let event = ServerEvent::from_value(raw.clone()).expect("decode");
        assert_eq!(router.dispatch(&event), 1);

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            ServerEvent::Unknown { kind, payload } => {
                assert_eq!(kind, "some_future_kind");
                assert_eq!(payload, &raw);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_without_handlers_are_dropped() {
        let router = EventRouter::new();
        let event = ServerEvent::from_value(json!({"type": "mystery", "timestamp": "T"}))
            .expect("decode");
        assert_eq!(router.dispatch(&event), 0);
        assert_eq!(router.dispatch(&pong()), 0);
    }

    #[test]
    fn last_registration_wins() {
        let log = Log::default();
        let router = EventRouter::new();
        router.on(EventKind::Pong, recorder(&log, "first"));
        router.on(EventKind::Pong, recorder(&log, "second"));

        router.dispatch(&pong());
        assert_eq!(*log.lock().expect("log"), vec!["second:pong".to_string()]);
    }

    #[test]
    fn merge_replaces_only_named_kinds() {
        let log = Log::default();
        let router = EventRouter::new();
        router.on(EventKind::Pong, recorder(&log, "pong-old"));
        router.on(EventKind::Error, recorder(&log, "error-old"));

        router.merge(HandlerSet::new().on(EventKind::Pong, recorder(&log, "pong-new")));
        assert!(router.has_handler(EventKind::Error));
        assert!(!router.has_wildcard());

        router.dispatch(&pong());
        router.dispatch(&ServerEvent::Error {
            session_id: None,
            error_message: "boom".to_string(),
            error_details: None,
            method_name: None,
            episode: None,
            timestamp: "T".to_string(),
        });
        assert_eq!(
            *log.lock().expect("log"),
            vec!["pong-new:pong".to_string(), "error-old:error".to_string()]
        );
    }

    #[test]
    fn handlers_may_reregister_during_dispatch() {
        let router = Arc::new(EventRouter::new());
        let hits = Arc::new(Mutex::new(0));
        {
            let inner = Arc::clone(&router);
            let hits = Arc::clone(&hits);
            router.on(EventKind::Pong, move |_| {
                *hits.lock().expect("hits") += 1;
                inner.off(EventKind::Pong);
            });
        }

        router.dispatch(&pong());
        router.dispatch(&pong());
        assert_eq!(*hits.lock().expect("hits"), 1);
        assert!(!router.has_handler(EventKind::Pong));
    }

    #[test]
    fn panicking_handler_does_not_stop_dispatch() {
        let log = Log::default();
        let router = EventRouter::new();
        router.on(EventKind::Pong, |_| panic!("handler failure"));
        router.on_any(recorder(&log, "any"));

        assert_eq!(router.dispatch(&pong()), 1);
        assert_eq!(router.dispatch(&pong()), 1);
        assert_eq!(
            *log.lock().expect("log"),
            vec!["any:pong".to_string(), "any:pong".to_string()]
        );
        assert!(router.has_handler(EventKind::Pong));
    }

    #[test]
    fn off_and_clear_report_removal() {
        let router = EventRouter::new();
        router.on(EventKind::Pong, |_| {});
        router.on_any(|_| {});

        assert!(router.off(EventKind::Pong));
        assert!(!router.off(EventKind::Pong));
        assert!(router.clear_wildcard());
        assert!(!router.clear_wildcard());
    }
}
