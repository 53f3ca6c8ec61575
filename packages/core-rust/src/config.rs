//! Framework-level configuration shared by the bus, dispatch, and health
//! subsystems.

/// Tunables for a single [`crate::application::Application`] instance and its
/// owned components.
///
/// Every limit has a production-safe default; tests override individual
/// fields via struct update syntax.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum retained event-history records (oldest evicted first).
    pub max_event_history: usize,
    /// Maximum listeners per event name; exceeding this is a registration
    /// error.
    pub max_listeners_per_event: usize,
    /// Event names excluded from debug logging (history is still recorded).
    pub high_frequency_events: Vec<String>,
    /// Object field names removed from event history and call logs.
    pub sensitive_fields: Vec<String>,
    /// Maximum retained per-call performance records.
    pub max_performance_records: usize,
    /// Calls slower than this are reported by the slow-call query.
    pub slow_call_threshold_ms: u64,
    /// Process memory above this flips the memory health check to warning.
    pub memory_warn_bytes: u64,
    /// IPC error rate (percent) above which overall health degrades.
    pub max_error_rate_percent: f64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_event_history: 1000,
            max_listeners_per_event: 100,
            high_frequency_events: vec![
                "heartbeat".to_string(),
                "tick".to_string(),
                "progress".to_string(),
            ],
            sensitive_fields: vec![
                "password".to_string(),
                "token".to_string(),
                "secret".to_string(),
            ],
            max_performance_records: 1000,
            slow_call_threshold_ms: 1000,
            memory_warn_bytes: 500 * 1024 * 1024,
            max_error_rate_percent: 5.0,
        }
    }
}
