//! Per-call request metadata and the mutable context threaded through the
//! middleware chain into the handler.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::ipc::options::RouteOptions;
use crate::time::epoch_ms;

/// Immutable facts about one dispatched call.
#[derive(Clone, Debug)]
pub struct RequestEvent {
    /// Monotonic per-manager call counter.
    pub call_id: u64,
    /// Correlation id carried through logs and error events.
    pub request_id: Uuid,
    pub channel: String,
    pub received_at_ms: u64,
}

impl RequestEvent {
    pub(crate) fn new(call_id: u64, channel: &str) -> Self {
        Self {
            call_id,
            request_id: Uuid::new_v4(),
            channel: channel.to_string(),
            received_at_ms: epoch_ms(),
        }
    }
}

/// Mutable state for one call as it flows through middleware to the handler.
///
/// Middleware may rewrite `args` before delegating and may stash values in
/// `data` for later links in the chain; the handler sees the final state.
pub struct CallContext {
    pub event: RequestEvent,
    pub channel: String,
    pub args: Vec<Value>,
    pub options: RouteOptions,
    /// Scratch space shared along the chain.
    pub data: HashMap<String, Value>,
}

impl CallContext {
    pub(crate) fn new(event: RequestEvent, args: Vec<Value>, options: RouteOptions) -> Self {
        let channel = event.channel.clone();
        Self {
            event,
            channel,
            args,
            options,
            data: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("channel", &self.channel)
            .field("call_id", &self.event.call_id)
            .field("args", &self.args.len())
            .finish_non_exhaustive()
    }
}
