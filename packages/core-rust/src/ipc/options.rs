//! Per-route behavior switches supplied at registration time.

use std::sync::Arc;

use crate::ipc::middleware::Middleware;

/// Signature validator run against the raw argument list before the handler.
pub type ArgsValidator = Arc<dyn Fn(&[serde_json::Value]) -> Result<(), String> + Send + Sync>;

/// Options attached to a route when it is registered.
///
/// The defaults log request and success lines without payloads, surface
/// handler errors to the caller, and impose no timeout or exclusivity.
#[derive(Clone)]
pub struct RouteOptions {
    pub log_request: bool,
    pub log_success: bool,
    /// Include (sanitized) arguments in the request log line.
    pub log_args: bool,
    /// Include the result payload in the success log line.
    pub log_result: bool,
    /// When false, handler errors are folded into an error payload returned
    /// as a successful result instead of propagating to the caller.
    pub throw_error: bool,
    /// Serialize calls on this channel through a per-route lock.
    pub exclusive: bool,
    /// Abandon the handler after this many milliseconds.
    pub timeout_ms: Option<u64>,
    /// Route-specific middleware, run after the global chain.
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub validate_args: Option<ArgsValidator>,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            log_request: true,
            log_success: true,
            log_args: false,
            log_result: false,
            throw_error: true,
            exclusive: false,
            timeout_ms: None,
            middlewares: Vec::new(),
            validate_args: None,
        }
    }
}

impl RouteOptions {
    /// Quiet profile for chatty channels: no per-call log lines.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            log_request: false,
            log_success: false,
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for RouteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteOptions")
            .field("log_request", &self.log_request)
            .field("log_success", &self.log_success)
            .field("throw_error", &self.throw_error)
            .field("exclusive", &self.exclusive)
            .field("timeout_ms", &self.timeout_ms)
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}
