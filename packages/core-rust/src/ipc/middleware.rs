//! Interception chain for dispatched calls.
//!
//! Middleware wrap the handler in registration order: each link may inspect
//! or rewrite the context, short-circuit with its own result, or delegate to
//! the rest of the chain through [`Next`]. The global chain runs first,
//! followed by any route-local middleware, then the handler itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::ipc::context::CallContext;
use crate::time::epoch_ms;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Innermost link of the chain: the route handler, type-erased.
pub type TerminalFn =
    dyn for<'c> Fn(&'c mut CallContext) -> BoxFuture<'c, Result<Value, DispatchError>> + Send + Sync;

// ---------------------------------------------------------------------------
// Middleware and Next
// ---------------------------------------------------------------------------

/// One link in the dispatch chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs when a link fails.
    fn name(&self) -> &str {
        "middleware"
    }

    /// Process the call. Implementations delegate with `next.run(ctx).await`
    /// or short-circuit by returning without delegating.
    async fn handle(
        &self,
        ctx: &mut CallContext,
        next: Next<'_>,
    ) -> Result<Value, DispatchError>;
}

/// The remainder of the chain, handed to each middleware.
///
/// Consumed by `run`; a middleware that never calls it short-circuits the
/// call.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a TerminalFn,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], terminal: &'a TerminalFn) -> Self {
        Self { chain, terminal }
    }

    /// Run the remaining links, ending at the handler.
    ///
    /// # Errors
    ///
    /// Whatever the downstream links or the handler return.
    pub async fn run(self, ctx: &mut CallContext) -> Result<Value, DispatchError> {
        match self.chain.split_first() {
            Some((head, tail)) => {
                head.handle(ctx, Next::new(tail, self.terminal)).await
            }
            None => (self.terminal)(ctx).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in middleware
// ---------------------------------------------------------------------------

/// Shallow redaction of sensitive keys in object-shaped arguments.
pub(crate) fn redact_args(args: &[Value], sensitive_fields: &[String]) -> Vec<Value> {
    args.iter()
        .map(|arg| match arg {
            Value::Object(map) => {
                let mut clean = map.clone();
                for field in sensitive_fields {
                    clean.remove(field);
                }
                Value::Object(clean)
            }
            other => other.clone(),
        })
        .collect()
}

/// Structured request/success logging honoring the route's log switches.
pub struct RequestLogMiddleware {
    sensitive_fields: Vec<String>,
}

impl RequestLogMiddleware {
    #[must_use]
    pub fn new(sensitive_fields: Vec<String>) -> Self {
        Self { sensitive_fields }
    }
}

#[async_trait]
impl Middleware for RequestLogMiddleware {
    fn name(&self) -> &str {
        "request-log"
    }

    async fn handle(
        &self,
        ctx: &mut CallContext,
        next: Next<'_>,
    ) -> Result<Value, DispatchError> {
        let started = epoch_ms();
        if ctx.options.log_request {
            if ctx.options.log_args {
                let args = Value::Array(redact_args(&ctx.args, &self.sensitive_fields));
                info!(
                    channel = %ctx.channel,
                    request_id = %ctx.event.request_id,
                    args = %args,
                    "ipc request"
                );
            } else {
                info!(
                    channel = %ctx.channel,
                    request_id = %ctx.event.request_id,
                    "ipc request"
                );
            }
        }

        let result = next.run(ctx).await;

        match &result {
            Ok(value) if ctx.options.log_success => {
                let elapsed = epoch_ms().saturating_sub(started);
                if ctx.options.log_result {
                    info!(
                        channel = %ctx.channel,
                        request_id = %ctx.event.request_id,
                        elapsed_ms = elapsed,
                        result = %value,
                        "ipc success"
                    );
                } else {
                    info!(
                        channel = %ctx.channel,
                        request_id = %ctx.event.request_id,
                        elapsed_ms = elapsed,
                        "ipc success"
                    );
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    channel = %ctx.channel,
                    request_id = %ctx.event.request_id,
                    code = err.code(),
                    error = %err,
                    "ipc failure"
                );
            }
        }
        result
    }
}

/// Runs the route's argument validator, if any, before the handler.
pub struct ValidateArgsMiddleware;

#[async_trait]
impl Middleware for ValidateArgsMiddleware {
    fn name(&self) -> &str {
        "validate-args"
    }

    async fn handle(
        &self,
        ctx: &mut CallContext,
        next: Next<'_>,
    ) -> Result<Value, DispatchError> {
        if let Some(validator) = ctx.options.validate_args.clone() {
            if let Err(reason) = validator(&ctx.args) {
                return Err(DispatchError::InvalidArgs {
                    channel: ctx.channel.clone(),
                    reason,
                });
            }
        }
        next.run(ctx).await
    }
}
