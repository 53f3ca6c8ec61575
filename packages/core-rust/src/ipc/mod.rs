//! Call dispatch: channels, middleware, and per-call bookkeeping.

pub mod context;
pub mod manager;
pub mod middleware;
pub mod options;

pub use context::{CallContext, RequestEvent};
pub use manager::{Handler, IpcManager, IpcStats, PerformanceRecord};
pub use middleware::{BoxFuture, Middleware, Next, RequestLogMiddleware, ValidateArgsMiddleware};
pub use options::{ArgsValidator, RouteOptions};
