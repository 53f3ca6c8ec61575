//! Error taxonomy for the dispatch framework.
//!
//! Each subsystem owns a dedicated enum so callers can match on failure class
//! without string inspection: `BusError` (event bus), `ContainerError`
//! (dependency container), `DispatchError` (channel dispatch), and
//! `ControllerError` (unit lifecycle).

use serde_json::{json, Value};

use crate::time::epoch_ms;

// ---------------------------------------------------------------------------
// BusError
// ---------------------------------------------------------------------------

/// Errors surfaced by the event bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Listener cap exceeded at registration time. This is a configuration
    /// error, never a silent drop.
    #[error("too many listeners for event '{event}' (max {max})")]
    TooManyListeners { event: String, max: usize },

    /// `wait_for`/`once_with_timeout` expired before a matching emission.
    #[error("timed out waiting for event '{event}' after {timeout_ms}ms")]
    Timeout { event: String, timeout_ms: u64 },

    /// A listener returned an error during a plain `emit` (propagated to the
    /// emitter; `safe_emit` folds this into a log line instead).
    #[error("listener failed for event '{event}': {source}")]
    Listener {
        event: String,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// ContainerError
// ---------------------------------------------------------------------------

/// Errors surfaced by the dependency container.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Resolve was called for a name that was never registered.
    #[error("service '{0}' is not registered")]
    NotFound(String),

    /// Resolve re-entered for a name already mid-resolution.
    #[error("circular dependency detected while resolving '{0}'")]
    CircularDependency(String),

    /// A factory failed while constructing the instance.
    #[error("failed to construct service '{name}': {source}")]
    Construction {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Errors surfaced by channel dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No handler is registered for the channel.
    #[error("no handler registered for channel '{channel}'")]
    UnknownChannel { channel: String },

    /// The route timeout elapsed. The in-flight handler is abandoned, not
    /// cancelled; its eventual result is discarded.
    #[error("channel '{channel}' timed out after {timeout_ms}ms")]
    Timeout { channel: String, timeout_ms: u64 },

    /// The route's argument validator rejected the call.
    #[error("invalid arguments for channel '{channel}': {reason}")]
    InvalidArgs { channel: String, reason: String },

    /// The registered handler (or a middleware) failed.
    #[error("handler failed on channel '{channel}': {source}")]
    Handler {
        channel: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    /// Stable machine-readable code for the error class.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownChannel { .. } => "UNKNOWN_CHANNEL",
            Self::Timeout { .. } => "TIMEOUT",
            Self::InvalidArgs { .. } => "INVALID_ARGS",
            Self::Handler { .. } => "HANDLER_ERROR",
        }
    }

    /// The bare failure message, without the channel prefix. For handler
    /// failures this is the underlying error's own message, which is what
    /// callers asked for when they set `throw_error = false`.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Handler { source, .. } => source.to_string(),
            Self::InvalidArgs { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Structured error payload returned instead of a failure when the route
    /// was registered with `throw_error = false`.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        json!({
            "error": self.message(),
            "code": self.code(),
            "timestamp": epoch_ms(),
        })
    }
}

// ---------------------------------------------------------------------------
// ControllerError
// ---------------------------------------------------------------------------

/// Errors surfaced by controller loading and lifecycle management.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Failure while instantiating, initializing, or registering a unit.
    /// The manager logs and skips the unit; other units are unaffected.
    #[error("failed to load controller '{id}': {source}")]
    Load {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Operation attempted on a unit that was already destroyed.
    #[error("controller '{name}' is destroyed")]
    Destroyed { name: String },

    /// No definition registered under this id.
    #[error("unknown controller '{id}'")]
    Unknown { id: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_payload_carries_bare_message() {
        let err = DispatchError::Handler {
            channel: "fail".to_string(),
            source: anyhow::anyhow!("x"),
        };
        let payload = err.to_payload();
        assert_eq!(payload["error"], "x");
        assert_eq!(payload["code"], "HANDLER_ERROR");
        assert!(payload["timestamp"].as_u64().is_some());
    }

    #[test]
    fn timeout_code_and_display() {
        let err = DispatchError::Timeout {
            channel: "slow".to_string(),
            timeout_ms: 50,
        };
        assert_eq!(err.code(), "TIMEOUT");
        assert!(err.to_string().contains("50ms"));
    }
}
