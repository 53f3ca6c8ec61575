//! `ThemeDesk` Core — event bus, dependency container, channel dispatch with
//! middleware, and controller lifecycle management.

pub mod application;
pub mod bus;
pub mod config;
pub mod container;
pub mod controller;
pub mod error;
pub mod ipc;
pub mod registry;
pub mod time;

pub use application::{Application, ApplicationOptions};
pub use bus::{EventBus, EventRecord, Listener, ListenerId};
pub use config::CoreConfig;
pub use container::{DiContainer, ResolveContext, Service, ServiceInstance};
pub use controller::{Controller, ControllerContext, ControllerHost, ControllerState, RouteDef};
pub use error::{BusError, ContainerError, ControllerError, DispatchError};
pub use ipc::{Handler, IpcManager, Middleware, Next, RouteOptions};
pub use registry::{ControllerFactory, ControllerManager};
