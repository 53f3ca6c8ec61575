//! Process-wide publish/subscribe channel with bounded history.
//!
//! The bus is the notification backbone between the container, the dispatch
//! layer, and controller units. Emission is synchronous fan-out in listener
//! registration order; every emission is appended (redacted) to a capped
//! history ring for introspection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::CoreConfig;
use crate::error::BusError;
use crate::time::epoch_ms;

// ---------------------------------------------------------------------------
// Well-known event names
// ---------------------------------------------------------------------------

/// Event names emitted by the framework itself.
pub mod event_names {
    pub const APPLICATION_STARTED: &str = "application:started";
    pub const APPLICATION_STOPPED: &str = "application:stopped";
    pub const ERROR_OCCURRED: &str = "error:occurred";
    pub const CONTROLLER_INIT: &str = "controller:init";
    pub const CONTROLLER_REGISTER: &str = "controller:register";
    pub const CONTROLLER_DESTROY: &str = "controller:destroy";
    pub const SERVICE_REGISTERED: &str = "service:registered";
    pub const SERVICE_RESOLVED: &str = "service:resolved";
    pub const SERVICE_REMOVED: &str = "service:removed";
    pub const CALL_START: &str = "ipc:call:start";
    pub const CALL_SUCCESS: &str = "ipc:call:success";
}

// ---------------------------------------------------------------------------
// Listener types
// ---------------------------------------------------------------------------

/// Callback invoked on every matching emission. Returning an error fails a
/// plain `emit`; `safe_emit` logs it instead.
pub type Listener = Arc<dyn Fn(&[Value]) -> anyhow::Result<()> + Send + Sync>;

/// Predicate used by [`EventBus::wait_for`] to filter emissions.
pub type EventPredicate = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// Token identifying one attached listener. Detachment is always by exact
/// token, never a blanket removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    once: bool,
    callback: Listener,
}

// ---------------------------------------------------------------------------
// EventRecord
// ---------------------------------------------------------------------------

/// One emission as retained in the history ring. Arguments are stored after
/// sensitive-field redaction.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub name: String,
    pub args: Vec<Value>,
    pub timestamp_ms: u64,
}

/// Aggregate counters exposed by [`EventBus::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct EventBusStats {
    pub total_events: usize,
    pub event_types: HashMap<String, usize>,
    pub listeners: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Publish/subscribe bus with bounded history and safe (non-failing)
/// emission.
///
/// One bus is owned per [`crate::application::Application`]; components hold
/// it by `Arc`, never through ambient global state, so independent
/// applications can coexist in tests.
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<ListenerEntry>>>,
    history: Mutex<VecDeque<EventRecord>>,
    next_id: AtomicU64,
    max_history: usize,
    max_listeners: usize,
    high_frequency: Vec<String>,
    sensitive_fields: Vec<String>,
}

impl EventBus {
    #[must_use]
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            max_history: config.max_event_history,
            max_listeners: config.max_listeners_per_event,
            high_frequency: config.high_frequency_events.clone(),
            sensitive_fields: config.sensitive_fields.clone(),
        }
    }

    /// Attach a listener.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TooManyListeners`] when the per-event cap is
    /// already reached. The cap is enforced at registration time so listener
    /// leaks surface as configuration errors, not silent drops.
    pub fn on(&self, event: &str, listener: Listener) -> Result<ListenerId, BusError> {
        self.attach(event, listener, false)
    }

    /// Attach a listener that detaches itself after its first invocation.
    ///
    /// # Errors
    ///
    /// Same as [`EventBus::on`].
    pub fn once(&self, event: &str, listener: Listener) -> Result<ListenerId, BusError> {
        self.attach(event, listener, true)
    }

    fn attach(&self, event: &str, listener: Listener, once: bool) -> Result<ListenerId, BusError> {
        let mut map = self.listeners.write();
        let entries = map.entry(event.to_string()).or_default();
        if entries.len() >= self.max_listeners {
            return Err(BusError::TooManyListeners {
                event: event.to_string(),
                max: self.max_listeners,
            });
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.push(ListenerEntry {
            id,
            once,
            callback: listener,
        });
        Ok(id)
    }

    /// Detach one listener by its exact id. Returns `true` if it was found.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut map = self.listeners.write();
        if let Some(entries) = map.get_mut(event) {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            return entries.len() < before;
        }
        false
    }

    /// Emit an event: record it in history, log it (unless high-frequency),
    /// then invoke the listeners synchronously in registration order.
    ///
    /// Returns the number of listeners invoked.
    ///
    /// # Errors
    ///
    /// Propagates the first listener failure; later listeners are skipped, as
    /// in synchronous fan-out.
    pub fn emit(&self, event: &str, args: &[Value]) -> Result<usize, BusError> {
        let sanitized = self.sanitize_args(args);
        self.record(event, sanitized);

        if !self.high_frequency.iter().any(|name| name == event) {
            debug!(event, "event emitted");
        }

        let to_run: Vec<(ListenerId, Listener)> = {
            let mut map = self.listeners.write();
            match map.get_mut(event) {
                Some(entries) => {
                    let snapshot = entries
                        .iter()
                        .map(|entry| (entry.id, Arc::clone(&entry.callback)))
                        .collect();
                    entries.retain(|entry| !entry.once);
                    snapshot
                }
                None => Vec::new(),
            }
        };

        let invoked = to_run.len();
        for (_, callback) in to_run {
            callback(args).map_err(|source| BusError::Listener {
                event: event.to_string(),
                source,
            })?;
        }
        Ok(invoked)
    }

    /// Emit without ever failing the caller: listener errors are logged and
    /// swallowed. Returns `true` when every listener ran cleanly.
    pub fn safe_emit(&self, event: &str, args: &[Value]) -> bool {
        match self.emit(event, args) {
            Ok(_) => true,
            Err(err) => {
                error!(event, error = %err, "event emission failed");
                false
            }
        }
    }

    /// Suspend until the event fires (optionally matching `predicate`) or the
    /// timeout elapses.
    ///
    /// # Errors
    ///
    /// [`BusError::Timeout`] after `timeout`, or [`BusError::TooManyListeners`]
    /// if the internal listener cannot be attached.
    pub async fn wait_for(
        &self,
        event: &str,
        timeout: Duration,
        predicate: Option<EventPredicate>,
    ) -> Result<Vec<Value>, BusError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<Value>>();
        let id = self.on(
            event,
            Arc::new(move |args| {
                // Receiver may already be gone after a timeout; ignore.
                let _ = tx.send(args.to_vec());
                Ok(())
            }),
        )?;

        let deadline = tokio::time::Instant::now() + timeout;
        let result = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(args)) => {
                    let matches = predicate.as_ref().is_none_or(|check| check(&args));
                    if matches {
                        break Ok(args);
                    }
                }
                Ok(None) | Err(_) => {
                    break Err(BusError::Timeout {
                        event: event.to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
        };
        self.off(event, id);
        result
    }

    /// One-shot wait: resolves with the first emission of `event` or fails
    /// after `timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`EventBus::wait_for`].
    pub async fn once_with_timeout(
        &self,
        event: &str,
        timeout: Duration,
    ) -> Result<Vec<Value>, BusError> {
        self.wait_for(event, timeout, None).await
    }

    /// Number of listeners currently attached to `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// History records, optionally filtered by event name, most recent last.
    #[must_use]
    pub fn get_event_history(&self, event: Option<&str>, limit: usize) -> Vec<EventRecord> {
        let history = self.history.lock();
        let filtered: Vec<EventRecord> = history
            .iter()
            .filter(|record| event.is_none_or(|name| record.name == name))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    #[must_use]
    pub fn get_stats(&self) -> EventBusStats {
        let history = self.history.lock();
        let mut event_types: HashMap<String, usize> = HashMap::new();
        for record in history.iter() {
            *event_types.entry(record.name.clone()).or_insert(0) += 1;
        }
        let listeners = self
            .listeners
            .read()
            .iter()
            .map(|(name, entries)| (name.clone(), entries.len()))
            .collect();
        EventBusStats {
            total_events: history.len(),
            event_types,
            listeners,
        }
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Drop all listeners and history. Called on application teardown.
    pub fn destroy(&self) {
        self.listeners.write().clear();
        self.clear_history();
    }

    fn record(&self, event: &str, args: Vec<Value>) {
        let mut history = self.history.lock();
        history.push_back(EventRecord {
            name: event.to_string(),
            args,
            timestamp_ms: epoch_ms(),
        });
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    /// Shallow redaction: sensitive keys are removed from object arguments
    /// before the record enters history or logs.
    fn sanitize_args(&self, args: &[Value]) -> Vec<Value> {
        args.iter()
            .map(|arg| match arg {
                Value::Object(map) => {
                    let mut clean = map.clone();
                    for field in &self.sensitive_fields {
                        clean.remove(field);
                    }
                    Value::Object(clean)
                }
                other => other.clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.listeners.read().len())
            .field("history", &self.history.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&CoreConfig::default())
    }
}

#[async_trait::async_trait]
impl crate::container::Service for EventBus {
    async fn destroy(&self) -> anyhow::Result<()> {
        EventBus::destroy(self);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;

    fn small_bus(history: usize, listeners: usize) -> EventBus {
        EventBus::new(&CoreConfig {
            max_event_history: history,
            max_listeners_per_event: listeners,
            ..CoreConfig::default()
        })
    }

    #[test]
    fn history_is_capped_and_ordered() {
        let bus = small_bus(3, 100);
        for n in 0..5 {
            bus.safe_emit(&format!("evt-{n}"), &[]);
        }
        let history = bus.get_event_history(None, 100);
        let names: Vec<&str> = history.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["evt-2", "evt-3", "evt-4"]);
    }

    #[test]
    fn sensitive_fields_are_redacted_in_history() {
        let bus = small_bus(10, 100);
        bus.safe_emit(
            "login",
            &[json!({"user": "kay", "password": "hunter2", "token": "t"})],
        );
        let history = bus.get_event_history(Some("login"), 10);
        let record = &history[0].args[0];
        assert_eq!(record["user"], "kay");
        assert!(record.get("password").is_none());
        assert!(record.get("token").is_none());
    }

    #[test]
    fn once_listener_fires_exactly_once() {
        let bus = small_bus(10, 100);
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);
        bus.once(
            "ping",
            Arc::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

        bus.safe_emit("ping", &[]);
        bus.safe_emit("ping", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("ping"), 0);
    }

    #[test]
    fn off_detaches_by_exact_id() {
        let bus = small_bus(10, 100);
        let hits = Arc::new(AtomicU32::new(0));

        let keep = Arc::clone(&hits);
        bus.on(
            "e",
            Arc::new(move |_| {
                keep.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        let removed = Arc::clone(&hits);
        let id = bus
            .on(
                "e",
                Arc::new(move |_| {
                    removed.fetch_add(10, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        assert!(bus.off("e", id));
        bus.safe_emit("e", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_cap_is_a_registration_error() {
        let bus = small_bus(10, 2);
        bus.on("e", Arc::new(|_| Ok(()))).unwrap();
        bus.on("e", Arc::new(|_| Ok(()))).unwrap();
        let err = bus.on("e", Arc::new(|_| Ok(()))).unwrap_err();
        assert!(matches!(err, BusError::TooManyListeners { max: 2, .. }));
    }

    #[test]
    fn safe_emit_swallows_listener_errors() {
        let bus = small_bus(10, 100);
        bus.on("boom", Arc::new(|_| Err(anyhow::anyhow!("listener broke"))))
            .unwrap();
        assert!(!bus.safe_emit("boom", &[]));

        // A plain emit propagates the same failure.
        let err = bus.emit("boom", &[]).unwrap_err();
        assert!(matches!(err, BusError::Listener { .. }));
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_event() {
        let bus = Arc::new(small_bus(10, 100));
        let emitter = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            emitter.safe_emit("job:done", &[json!(1)]);
            emitter.safe_emit("job:done", &[json!(42)]);
        });

        let predicate: EventPredicate = Arc::new(|args| args[0] == json!(42));
        let args = bus
            .wait_for("job:done", Duration::from_secs(1), Some(predicate))
            .await
            .unwrap();
        assert_eq!(args[0], json!(42));
        assert_eq!(bus.listener_count("job:done"), 0);
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let bus = small_bus(10, 100);
        let err = bus
            .once_with_timeout("never", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
        assert_eq!(bus.listener_count("never"), 0);
    }

    #[test]
    fn stats_count_events_and_listeners() {
        let bus = small_bus(10, 100);
        bus.on("a", Arc::new(|_| Ok(()))).unwrap();
        bus.safe_emit("a", &[]);
        bus.safe_emit("a", &[]);
        bus.safe_emit("b", &[]);

        let stats = bus.get_stats();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.event_types["a"], 2);
        assert_eq!(stats.listeners["a"], 1);
    }
}
