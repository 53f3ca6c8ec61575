//! Channel registry and call dispatcher.
//!
//! Each channel owns one handler plus its [`RouteOptions`]. A call flows
//! through the global middleware chain, then the route's own middleware,
//! then the handler. Handlers with a timeout run on a spawned task so an
//! overrunning handler is abandoned rather than awaited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::bus::{event_names, EventBus};
use crate::config::CoreConfig;
use crate::error::DispatchError;
use crate::ipc::context::{CallContext, RequestEvent};
use crate::ipc::middleware::{
    BoxFuture, Middleware, Next, RequestLogMiddleware, TerminalFn, ValidateArgsMiddleware,
};
use crate::ipc::options::RouteOptions;
use crate::time::epoch_ms;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Type-erased route handler.
///
/// Handlers take the argument list by value and return a `'static` future,
/// which lets the dispatcher move them onto a spawned task for
/// timeout-with-abandonment.
#[derive(Clone)]
pub struct Handler {
    func: Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>,
}

impl Handler {
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |args| Box::pin(f(args))),
        }
    }

    fn invoke(&self, args: Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.func)(args)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

struct Route {
    handler: Handler,
    options: RouteOptions,
    /// Present when the route is exclusive; held for the whole call.
    lock: Option<Arc<tokio::sync::Mutex<()>>>,
    registered_at_ms: u64,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// One completed call, kept in a bounded ring for performance reports.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceRecord {
    pub channel: String,
    pub call_id: u64,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub success: bool,
    /// Failure message for unsuccessful calls, `None` otherwise.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    pub calls: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub last_called_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IpcStats {
    pub total_calls: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub channels: HashMap<String, ChannelStats>,
}

impl IpcStats {
    fn record(&mut self, channel: &str, duration_ms: u64, success: bool) {
        self.total_calls += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        let duration = duration_ms as f64;
        self.avg_duration_ms += (duration - self.avg_duration_ms) / self.total_calls as f64;

        let entry = self.channels.entry(channel.to_string()).or_default();
        entry.calls += 1;
        if success {
            entry.succeeded += 1;
        } else {
            entry.failed += 1;
        }
        entry.avg_duration_ms += (duration - entry.avg_duration_ms) / entry.calls as f64;
        entry.last_called_ms = epoch_ms();
    }

    /// Failed calls as a percentage of all calls.
    #[must_use]
    pub fn error_rate_percent(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed as f64 / self.total_calls as f64 * 100.0
        }
    }
}

// ---------------------------------------------------------------------------
// IpcManager
// ---------------------------------------------------------------------------

/// Routes calls by channel name through middleware to registered handlers.
pub struct IpcManager {
    routes: dashmap::DashMap<String, Arc<Route>>,
    global_middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    bus: Arc<EventBus>,
    stats: Mutex<IpcStats>,
    performance: Mutex<std::collections::VecDeque<PerformanceRecord>>,
    next_call_id: AtomicU64,
    max_performance_records: usize,
    slow_call_threshold_ms: u64,
}

impl IpcManager {
    /// Build a manager with the built-in chain installed: request logging
    /// first, argument validation second.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, config: &CoreConfig) -> Self {
        let base: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(RequestLogMiddleware::new(config.sensitive_fields.clone())),
            Arc::new(ValidateArgsMiddleware),
        ];
        Self {
            routes: dashmap::DashMap::new(),
            global_middlewares: RwLock::new(base),
            bus,
            stats: Mutex::new(IpcStats::default()),
            performance: Mutex::new(std::collections::VecDeque::with_capacity(
                config.max_performance_records,
            )),
            next_call_id: AtomicU64::new(1),
            max_performance_records: config.max_performance_records,
            slow_call_threshold_ms: config.slow_call_threshold_ms,
        }
    }

    /// Register `handler` on `channel`. Re-registering a channel replaces the
    /// previous handler and logs a warning.
    pub fn handle(&self, channel: &str, handler: Handler, options: RouteOptions) {
        let lock = options
            .exclusive
            .then(|| Arc::new(tokio::sync::Mutex::new(())));
        let previous = self.routes.insert(
            channel.to_string(),
            Arc::new(Route {
                handler,
                options,
                lock,
                registered_at_ms: epoch_ms(),
            }),
        );
        if previous.is_some() {
            warn!(channel, "channel handler replaced");
        } else {
            debug!(channel, "channel handler registered");
        }
    }

    /// Detach the handler on `channel`. Returns whether one was registered.
    pub fn remove_handler(&self, channel: &str) -> bool {
        let removed = self.routes.remove(channel).is_some();
        if removed {
            debug!(channel, "channel handler removed");
        }
        removed
    }

    /// Append a middleware to the global chain. It applies to calls
    /// dispatched after this point, on every channel.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.global_middlewares.write().push(middleware);
    }

    #[must_use]
    pub fn has_channel(&self, channel: &str) -> bool {
        self.routes.contains_key(channel)
    }

    #[must_use]
    pub fn get_registered_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    /// Dispatch a call on `channel`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownChannel`] when nothing is registered,
    /// otherwise whatever the chain or handler produced. Routes registered
    /// with `throw_error: false` fold handler failures into an error payload
    /// returned as `Ok`.
    pub async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, DispatchError> {
        let Some(route) = self.routes.get(channel).map(|e| Arc::clone(e.value())) else {
            metrics::counter!("ipc_unknown_channel_total").increment(1);
            return Err(DispatchError::UnknownChannel {
                channel: channel.to_string(),
            });
        };

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let event = RequestEvent::new(call_id, channel);
        let started_at_ms = event.received_at_ms;
        self.bus.safe_emit(
            event_names::CALL_START,
            &[json!({"channel": channel, "callId": call_id})],
        );

        // Held for the whole call so exclusive routes serialize.
        let _guard = match &route.lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let chain: Vec<Arc<dyn Middleware>> = {
            let global = self.global_middlewares.read();
            global
                .iter()
                .chain(route.options.middlewares.iter())
                .cloned()
                .collect()
        };

        let handler = route.handler.clone();
        let timeout_ms = route.options.timeout_ms;
        let terminal: Box<TerminalFn> = Box::new(move |ctx: &mut CallContext| {
            let fut = handler.invoke(ctx.args.clone());
            let channel = ctx.channel.clone();
            let boxed: BoxFuture<'_, Result<Value, DispatchError>> =
                Box::pin(run_handler(channel, fut, timeout_ms));
            boxed
        });

        let mut ctx = CallContext::new(event, args, route.options.clone());
        let result = Next::new(&chain, &terminal).run(&mut ctx).await;

        let duration_ms = epoch_ms().saturating_sub(started_at_ms);
        let error = result.as_ref().err().map(DispatchError::message);
        self.record_call(channel, call_id, started_at_ms, duration_ms, error);

        match result {
            Ok(value) => {
                self.bus.safe_emit(
                    event_names::CALL_SUCCESS,
                    &[json!({"channel": channel, "callId": call_id, "durationMs": duration_ms})],
                );
                Ok(value)
            }
            Err(err) => {
                self.bus
                    .safe_emit(event_names::ERROR_OCCURRED, &[err.to_payload()]);
                if route.options.throw_error {
                    Err(err)
                } else {
                    Ok(err.to_payload())
                }
            }
        }
    }

    fn record_call(
        &self,
        channel: &str,
        call_id: u64,
        started_at_ms: u64,
        duration_ms: u64,
        error: Option<String>,
    ) {
        let success = error.is_none();
        self.stats.lock().record(channel, duration_ms, success);

        let mut performance = self.performance.lock();
        if performance.len() == self.max_performance_records {
            performance.pop_front();
        }
        performance.push_back(PerformanceRecord {
            channel: channel.to_string(),
            call_id,
            started_at_ms,
            duration_ms,
            success,
            error,
        });
        drop(performance);

        if duration_ms > self.slow_call_threshold_ms {
            warn!(channel, duration_ms, "slow ipc call");
        }

        let outcome = if success { "ok" } else { "error" };
        metrics::counter!("ipc_calls_total", "channel" => channel.to_string(), "outcome" => outcome)
            .increment(1);
        metrics::histogram!("ipc_call_duration_ms", "channel" => channel.to_string())
            .record(duration_ms as f64);
    }

    #[must_use]
    pub fn get_stats(&self) -> IpcStats {
        self.stats.lock().clone()
    }

    /// Most recent completed calls, newest last, up to `limit`, optionally
    /// filtered to one channel.
    #[must_use]
    pub fn get_performance_records(
        &self,
        channel: Option<&str>,
        limit: usize,
    ) -> Vec<PerformanceRecord> {
        let performance = self.performance.lock();
        let filtered: Vec<PerformanceRecord> = performance
            .iter()
            .filter(|record| channel.is_none_or(|name| record.channel == name))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// Calls from the performance ring that exceeded the slow-call
    /// threshold, slowest first.
    #[must_use]
    pub fn get_slow_calls(&self, limit: usize) -> Vec<PerformanceRecord> {
        let mut slow: Vec<PerformanceRecord> = self
            .performance
            .lock()
            .iter()
            .filter(|record| record.duration_ms > self.slow_call_threshold_ms)
            .cloned()
            .collect();
        slow.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        slow.truncate(limit);
        slow
    }

    /// Introspection record for one route, or `None` if absent.
    #[must_use]
    pub fn get_channel_info(&self, channel: &str) -> Option<Value> {
        self.routes.get(channel).map(|route| {
            json!({
                "channel": channel,
                "exclusive": route.options.exclusive,
                "timeoutMs": route.options.timeout_ms,
                "middlewares": route.options.middlewares.len(),
                "registeredAtMs": route.registered_at_ms,
            })
        })
    }

    pub fn clear_stats(&self) {
        *self.stats.lock() = IpcStats::default();
        self.performance.lock().clear();
    }

    /// Drop every route, the global chain, and all recorded stats.
    pub fn destroy(&self) {
        self.routes.clear();
        self.global_middlewares.write().clear();
        self.clear_stats();
        debug!("ipc manager destroyed");
    }
}

#[async_trait::async_trait]
impl crate::container::Service for IpcManager {
    async fn destroy(&self) -> anyhow::Result<()> {
        IpcManager::destroy(self);
        Ok(())
    }
}

impl std::fmt::Debug for IpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcManager")
            .field("routes", &self.routes.len())
            .field("middlewares", &self.global_middlewares.read().len())
            .finish_non_exhaustive()
    }
}

/// Run the handler future, spawning it onto the runtime when a timeout is
/// set so expiry abandons the task instead of cancelling mid-await.
async fn run_handler(
    channel: String,
    fut: BoxFuture<'static, anyhow::Result<Value>>,
    timeout_ms: Option<u64>,
) -> Result<Value, DispatchError> {
    match timeout_ms {
        Some(ms) => {
            let handle = tokio::spawn(fut);
            match tokio::time::timeout(Duration::from_millis(ms), handle).await {
                Ok(Ok(result)) => result.map_err(|source| DispatchError::Handler {
                    channel,
                    source,
                }),
                Ok(Err(join_err)) => Err(DispatchError::Handler {
                    channel,
                    source: anyhow::anyhow!(join_err),
                }),
                Err(_) => Err(DispatchError::Timeout {
                    channel,
                    timeout_ms: ms,
                }),
            }
        }
        None => fut.await.map_err(|source| DispatchError::Handler { channel, source }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
