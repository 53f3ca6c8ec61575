//! Controller abstraction: a named unit owning a set of channels, with an
//! explicit lifecycle driven by its host.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::bus::{event_names, EventBus, Listener, ListenerId};
use crate::container::{DiContainer, ResolveContext, ServiceInstance};
use crate::error::{ContainerError, ControllerError};
use crate::ipc::middleware::Middleware;
use crate::ipc::options::RouteOptions;
use crate::ipc::{Handler, IpcManager};
use crate::time::epoch_ms;

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Created,
    Initializing,
    Ready,
    Error,
    Destroyed,
}

// ---------------------------------------------------------------------------
// Controller contract
// ---------------------------------------------------------------------------

/// One channel a controller exposes.
pub struct RouteDef {
    pub channel: String,
    pub handler: Handler,
    pub options: RouteOptions,
}

impl RouteDef {
    #[must_use]
    pub fn new(channel: &str, handler: Handler) -> Self {
        Self {
            channel: channel.to_string(),
            handler,
            options: RouteOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RouteOptions) -> Self {
        self.options = options;
        self
    }
}

/// Everything a controller may reach during its lifecycle: the bus, the
/// container, and per-controller dependency overrides that shadow container
/// registrations (used for test doubles).
#[derive(Clone)]
pub struct ControllerContext {
    pub bus: Arc<EventBus>,
    pub container: Arc<DiContainer>,
    overrides: HashMap<String, ServiceInstance>,
}

impl ControllerContext {
    #[must_use]
    pub fn new(bus: Arc<EventBus>, container: Arc<DiContainer>) -> Self {
        Self {
            bus,
            container,
            overrides: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_override(mut self, name: &str, instance: ServiceInstance) -> Self {
        self.overrides.insert(name.to_string(), instance);
        self
    }

    /// Resolve a named dependency, preferring overrides.
    ///
    /// # Errors
    ///
    /// Container resolution errors for non-overridden names.
    pub fn dependency(&self, name: &str) -> Result<ServiceInstance, ContainerError> {
        if let Some(instance) = self.overrides.get(name) {
            return Ok(instance.clone());
        }
        self.container.resolve(name, &ResolveContext::new())
    }

    /// Like [`ControllerContext::dependency`], but an unresolvable name is a
    /// warning and `None`. For collaborators a controller can run without.
    #[must_use]
    pub fn try_dependency(&self, name: &str) -> Option<ServiceInstance> {
        match self.dependency(name) {
            Ok(instance) => Some(instance),
            Err(err) => {
                warn!(dependency = name, error = %err, "optional dependency unavailable");
                None
            }
        }
    }

    /// Resolve and downcast a named dependency.
    ///
    /// # Errors
    ///
    /// Resolution errors, plus a construction error when the instance is not
    /// a `T`.
    pub fn dependency_as<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, ContainerError> {
        self.dependency(name)?
            .downcast::<T>()
            .ok_or_else(|| ContainerError::Construction {
                name: name.to_string(),
                source: anyhow::anyhow!("dependency is not a {}", std::any::type_name::<T>()),
            })
    }
}

/// A unit of request-handling behavior.
///
/// Implementations declare their channels via [`Controller::routes`] and
/// their bus listeners via [`Controller::subscriptions`]; the host wires
/// both in and drives the lifecycle hooks around them.
#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;

    /// The channels this controller serves. Called once per registration.
    fn routes(&self) -> Vec<RouteDef>;

    /// Bus listeners owned by this controller, as `(event, listener)`
    /// pairs. The host attaches them after the routes and detaches them by
    /// id at destroy, so the unit never leaks listeners across reloads.
    fn subscriptions(&self) -> Vec<(String, Listener)> {
        Vec::new()
    }

    /// Middleware applied to every route of this controller, ahead of each
    /// route's own middleware.
    fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        Vec::new()
    }

    /// Runs before any route or subscription is wired. Failure leaves the
    /// host in `Error` with nothing registered.
    async fn before_init(&self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Runs once routes and subscriptions are live. Failure rolls the
    /// wiring back.
    async fn after_init(&self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Runs while routes and subscriptions are still attached.
    async fn before_destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after everything is detached.
    async fn after_destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ControllerHost
// ---------------------------------------------------------------------------

/// Summary row for one hosted controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerInfo {
    pub name: String,
    pub state: ControllerState,
    pub channels: Vec<String>,
    pub initialized_at_ms: Option<u64>,
}

/// Owns a controller's lifecycle and its channel registrations.
pub struct ControllerHost {
    controller: Arc<dyn Controller>,
    ipc: Arc<IpcManager>,
    bus: Arc<EventBus>,
    state: ArcSwap<ControllerState>,
    registered_channels: Mutex<Vec<String>>,
    attached_listeners: Mutex<Vec<(String, ListenerId)>>,
    initialized_at_ms: Mutex<Option<u64>>,
}

impl ControllerHost {
    #[must_use]
    pub fn new(controller: Arc<dyn Controller>, ipc: Arc<IpcManager>, bus: Arc<EventBus>) -> Self {
        Self {
            controller,
            ipc,
            bus,
            state: ArcSwap::from_pointee(ControllerState::Created),
            registered_channels: Mutex::new(Vec::new()),
            attached_listeners: Mutex::new(Vec::new()),
            initialized_at_ms: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        **self.state.load()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.controller.name()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ControllerState::Ready
    }

    #[must_use]
    pub fn info(&self) -> ControllerInfo {
        ControllerInfo {
            name: self.controller.name().to_string(),
            state: self.state(),
            channels: self.registered_channels.lock().clone(),
            initialized_at_ms: *self.initialized_at_ms.lock(),
        }
    }

    /// Run the controller's `before_init` hook, wire its routes and
    /// subscriptions, then run `after_init`. On `before_init` failure the
    /// host lands in `Error` with nothing registered; an `after_init`
    /// failure rolls the wiring back first.
    ///
    /// # Errors
    ///
    /// [`ControllerError::Destroyed`] when the host was torn down,
    /// [`ControllerError::Load`] when either init hook fails.
    pub async fn initialize(&self, ctx: &ControllerContext) -> Result<(), ControllerError> {
        let name = self.controller.name().to_string();
        match self.state() {
            ControllerState::Destroyed => {
                return Err(ControllerError::Destroyed { name });
            }
            ControllerState::Ready | ControllerState::Initializing => {
                debug!(controller = %name, "controller already initialized");
                return Ok(());
            }
            ControllerState::Created | ControllerState::Error => {}
        }

        self.state.store(Arc::new(ControllerState::Initializing));
        self.bus
            .safe_emit(event_names::CONTROLLER_INIT, &[json!({"name": name})]);

        if let Err(source) = self.controller.before_init(ctx).await {
            self.state.store(Arc::new(ControllerState::Error));
            error!(controller = %name, error = %source, "controller init failed");
            return Err(ControllerError::Load { id: name, source });
        }

        self.register_routes(&name);
        self.attach_subscriptions(&name);

        if let Err(source) = self.controller.after_init(ctx).await {
            self.detach_all();
            self.state.store(Arc::new(ControllerState::Error));
            error!(controller = %name, error = %source, "controller post-init failed");
            return Err(ControllerError::Load { id: name, source });
        }

        *self.initialized_at_ms.lock() = Some(epoch_ms());
        self.state.store(Arc::new(ControllerState::Ready));
        info!(controller = %name, "controller ready");
        Ok(())
    }

    fn register_routes(&self, name: &str) {
        let shared = self.controller.middlewares();
        let mut registered = self.registered_channels.lock();
        for route in self.controller.routes() {
            let mut options = route.options;
            if !shared.is_empty() {
                let mut merged = shared.clone();
                merged.extend(options.middlewares);
                options.middlewares = merged;
            }
            self.ipc.handle(&route.channel, route.handler, options);
            registered.push(route.channel.clone());
            self.bus.safe_emit(
                event_names::CONTROLLER_REGISTER,
                &[json!({"name": name, "channel": route.channel})],
            );
        }
    }

    fn attach_subscriptions(&self, name: &str) {
        let mut attached = self.attached_listeners.lock();
        for (event, listener) in self.controller.subscriptions() {
            match self.bus.on(&event, listener) {
                Ok(id) => attached.push((event, id)),
                Err(err) => {
                    warn!(controller = %name, event = %event, error = %err, "subscription rejected");
                }
            }
        }
    }

    /// Remove every registered channel and detach every recorded listener
    /// by its exact id.
    fn detach_all(&self) -> Vec<String> {
        let channels: Vec<String> = self.registered_channels.lock().drain(..).collect();
        for channel in &channels {
            self.ipc.remove_handler(channel);
        }
        for (event, id) in self.attached_listeners.lock().drain(..) {
            self.bus.off(&event, id);
        }
        channels
    }

    /// Run `before_destroy`, detach the controller's channels and
    /// subscriptions, then run `after_destroy`. Hook failures are logged;
    /// the host still ends up `Destroyed`.
    pub async fn destroy(&self) {
        let name = self.controller.name().to_string();
        if let Err(err) = self.controller.before_destroy().await {
            error!(controller = %name, error = %err, "controller pre-destroy hook failed");
        }
        let channels = self.detach_all();
        if let Err(err) = self.controller.after_destroy().await {
            error!(controller = %name, error = %err, "controller destroy hook failed");
        }
        self.state.store(Arc::new(ControllerState::Destroyed));
        self.bus.safe_emit(
            event_names::CONTROLLER_DESTROY,
            &[json!({"name": name, "channels": channels})],
        );
        debug!(controller = %name, "controller destroyed");
    }

    /// Tear the unit down and bring it back up with a fresh lifecycle.
    ///
    /// # Errors
    ///
    /// Same as [`ControllerHost::initialize`].
    pub async fn restart(&self, ctx: &ControllerContext) -> Result<(), ControllerError> {
        self.destroy().await;
        // Destroyed is terminal for external callers; restart resets it.
        self.state.store(Arc::new(ControllerState::Created));
        *self.initialized_at_ms.lock() = None;
        self.initialize(ctx).await
    }
}

impl std::fmt::Debug for ControllerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerHost")
            .field("name", &self.controller.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::Value;

    use super::*;
    use crate::config::CoreConfig;

    struct PingController {
        inits: Arc<AtomicU32>,
        destroys: Arc<AtomicU32>,
        fail_init: bool,
    }

    #[async_trait]
    impl Controller for PingController {
        fn name(&self) -> &str {
            "ping"
        }

        fn routes(&self) -> Vec<RouteDef> {
            vec![RouteDef::new(
                "ping:echo",
                Handler::from_fn(|args| async move { Ok(Value::Array(args)) }),
            )]
        }

        async fn before_init(&self, _ctx: &ControllerContext) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                anyhow::bail!("init exploded");
            }
            Ok(())
        }

        async fn after_destroy(&self) -> anyhow::Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        host: ControllerHost,
        ipc: Arc<IpcManager>,
        ctx: ControllerContext,
        inits: Arc<AtomicU32>,
        destroys: Arc<AtomicU32>,
    }

    fn fixture(fail_init: bool) -> Fixture {
        let bus = Arc::new(EventBus::default());
        let ipc = Arc::new(IpcManager::new(Arc::clone(&bus), &CoreConfig::default()));
        let container = Arc::new(DiContainer::new(Arc::clone(&bus)));
        let inits = Arc::new(AtomicU32::new(0));
        let destroys = Arc::new(AtomicU32::new(0));
        let controller = Arc::new(PingController {
            inits: Arc::clone(&inits),
            destroys: Arc::clone(&destroys),
            fail_init,
        });
        Fixture {
            host: ControllerHost::new(controller, Arc::clone(&ipc), Arc::clone(&bus)),
            ipc,
            ctx: ControllerContext::new(bus, container),
            inits,
            destroys,
        }
    }

    #[tokio::test]
    async fn initialize_registers_routes_and_reaches_ready() {
        let f = fixture(false);
        assert_eq!(f.host.state(), ControllerState::Created);

        f.host.initialize(&f.ctx).await.unwrap();
        assert_eq!(f.host.state(), ControllerState::Ready);
        assert!(f.ipc.has_channel("ping:echo"));
        assert_eq!(f.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_init_lands_in_error_with_nothing_registered() {
        let f = fixture(true);
        let err = f.host.initialize(&f.ctx).await.unwrap_err();
        assert!(matches!(err, ControllerError::Load { .. }));
        assert_eq!(f.host.state(), ControllerState::Error);
        assert!(!f.ipc.has_channel("ping:echo"));
    }

    #[tokio::test]
    async fn double_initialize_is_a_no_op() {
        let f = fixture(false);
        f.host.initialize(&f.ctx).await.unwrap();
        f.host.initialize(&f.ctx).await.unwrap();
        assert_eq!(f.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_detaches_channels_and_blocks_reinit() {
        let f = fixture(false);
        f.host.initialize(&f.ctx).await.unwrap();
        f.host.destroy().await;

        assert_eq!(f.host.state(), ControllerState::Destroyed);
        assert!(!f.ipc.has_channel("ping:echo"));
        assert_eq!(f.destroys.load(Ordering::SeqCst), 1);

        let err = f.host.initialize(&f.ctx).await.unwrap_err();
        assert!(matches!(err, ControllerError::Destroyed { .. }));
    }

    #[tokio::test]
    async fn restart_runs_a_fresh_lifecycle() {
        let f = fixture(false);
        f.host.initialize(&f.ctx).await.unwrap();
        f.host.restart(&f.ctx).await.unwrap();

        assert_eq!(f.host.state(), ControllerState::Ready);
        assert_eq!(f.inits.load(Ordering::SeqCst), 2);
        assert_eq!(f.destroys.load(Ordering::SeqCst), 1);
        assert!(f.ipc.has_channel("ping:echo"));
    }

    struct Watcher {
        seen: Arc<AtomicU32>,
        fail_after_init: bool,
    }

    #[async_trait]
    impl Controller for Watcher {
        fn name(&self) -> &str {
            "watcher"
        }

        fn routes(&self) -> Vec<RouteDef> {
            vec![RouteDef::new(
                "watcher:status",
                Handler::from_fn(|_| async move { Ok(Value::Null) }),
            )]
        }

        fn subscriptions(&self) -> Vec<(String, Listener)> {
            let seen = Arc::clone(&self.seen);
            vec![(
                "job:done".to_string(),
                Arc::new(move |_args| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )]
        }

        async fn after_init(&self, _ctx: &ControllerContext) -> anyhow::Result<()> {
            if self.fail_after_init {
                anyhow::bail!("post-init check failed");
            }
            Ok(())
        }
    }

    fn watcher_fixture(fail_after_init: bool) -> (ControllerHost, Arc<IpcManager>, ControllerContext, Arc<AtomicU32>) {
        let bus = Arc::new(EventBus::default());
        let ipc = Arc::new(IpcManager::new(Arc::clone(&bus), &CoreConfig::default()));
        let container = Arc::new(DiContainer::new(Arc::clone(&bus)));
        let seen = Arc::new(AtomicU32::new(0));
        let host = ControllerHost::new(
            Arc::new(Watcher {
                seen: Arc::clone(&seen),
                fail_after_init,
            }),
            Arc::clone(&ipc),
            Arc::clone(&bus),
        );
        (host, ipc, ControllerContext::new(bus, container), seen)
    }

    #[tokio::test]
    async fn subscriptions_attach_at_init_and_detach_at_destroy() {
        let (host, _ipc, ctx, seen) = watcher_fixture(false);
        host.initialize(&ctx).await.unwrap();

        assert_eq!(ctx.bus.listener_count("job:done"), 1);
        ctx.bus.safe_emit("job:done", &[Value::Null]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        host.destroy().await;
        assert_eq!(ctx.bus.listener_count("job:done"), 0);
        ctx.bus.safe_emit("job:done", &[Value::Null]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_after_init_rolls_the_wiring_back() {
        let (host, ipc, ctx, _seen) = watcher_fixture(true);
        let err = host.initialize(&ctx).await.unwrap_err();

        assert!(matches!(err, ControllerError::Load { .. }));
        assert_eq!(host.state(), ControllerState::Error);
        assert!(!ipc.has_channel("watcher:status"));
        assert_eq!(ctx.bus.listener_count("job:done"), 0);
    }

    #[tokio::test]
    async fn try_dependency_yields_none_for_unresolvable_names() {
        let bus = Arc::new(EventBus::default());
        let container = Arc::new(DiContainer::new(Arc::clone(&bus)));
        container
            .register_instance("label", ServiceInstance::from_value("real".to_string()))
            .unwrap();
        let ctx = ControllerContext::new(bus, container);

        assert!(ctx.try_dependency("label").is_some());
        assert!(ctx.try_dependency("missing").is_none());
    }

    #[tokio::test]
    async fn context_overrides_shadow_container_registrations() {
        let bus = Arc::new(EventBus::default());
        let container = Arc::new(DiContainer::new(Arc::clone(&bus)));
        container
            .register_instance("label", ServiceInstance::from_value("real".to_string()))
            .unwrap();

        let ctx = ControllerContext::new(bus, container)
            .with_override("label", ServiceInstance::from_value("double".to_string()));

        let label = ctx.dependency_as::<String>("label").unwrap();
        assert_eq!(*label, "double");
    }
}
