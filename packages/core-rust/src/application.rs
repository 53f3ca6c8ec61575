//! Top-level orchestrator: owns the bus, container, dispatcher, and
//! controller registry, and drives them through a common lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::bus::{event_names, EventBus};
use crate::config::CoreConfig;
use crate::container::{DiContainer, ServiceInstance};
use crate::controller::ControllerState;
use crate::ipc::IpcManager;
use crate::registry::ControllerManager;
use crate::time::epoch_ms;

/// Container names the orchestrator registers its own components under.
pub mod service_names {
    pub const EVENT_BUS: &str = "event-bus";
    pub const IPC_MANAGER: &str = "ipc-manager";
}

#[derive(Clone, Debug)]
pub struct ApplicationOptions {
    pub name: String,
    pub version: String,
    pub config: CoreConfig,
    /// Accepted for configuration compatibility; unit reloads are always
    /// available through the controller registry, so this only affects
    /// startup logging.
    pub hot_reload: bool,
    pub install_panic_hook: bool,
}

impl Default for ApplicationOptions {
    fn default() -> Self {
        Self {
            name: "application".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config: CoreConfig::default(),
            hot_reload: false,
            install_panic_hook: true,
        }
    }
}

/// The assembled framework.
///
/// Construction wires the components together; `start` registers the core
/// services in the container and brings the controllers up. `stop` unwinds
/// in reverse: controllers, dispatcher, container, bus.
pub struct Application {
    options: ApplicationOptions,
    bus: Arc<EventBus>,
    container: Arc<DiContainer>,
    ipc: Arc<IpcManager>,
    controllers: Arc<ControllerManager>,
    running: AtomicBool,
    /// Set for the duration of `stop` so the panic hook stays quiet while
    /// components tear down.
    shutting_down: Arc<AtomicBool>,
    started_at_ms: AtomicU64,
    system: Mutex<sysinfo::System>,
}

impl Application {
    #[must_use]
    pub fn new(options: ApplicationOptions) -> Self {
        let bus = Arc::new(EventBus::new(&options.config));
        let container = Arc::new(DiContainer::new(Arc::clone(&bus)));
        let ipc = Arc::new(IpcManager::new(Arc::clone(&bus), &options.config));
        let controllers = Arc::new(ControllerManager::new(
            Arc::clone(&bus),
            Arc::clone(&container),
            Arc::clone(&ipc),
        ));
        Self {
            options,
            bus,
            container,
            ipc,
            controllers,
            running: AtomicBool::new(false),
            shutting_down: Arc::new(AtomicBool::new(false)),
            started_at_ms: AtomicU64::new(0),
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn container(&self) -> &Arc<DiContainer> {
        &self.container
    }

    #[must_use]
    pub fn ipc(&self) -> &Arc<IpcManager> {
        &self.ipc
    }

    #[must_use]
    pub fn controllers(&self) -> &Arc<ControllerManager> {
        &self.controllers
    }

    /// Bring the application up. Idempotent; a second call warns and
    /// returns.
    ///
    /// # Errors
    ///
    /// Core service registration failures.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(name = %self.options.name, "application already running");
            return Ok(());
        }

        info!(
            name = %self.options.name,
            version = %self.options.version,
            hot_reload = self.options.hot_reload,
            "starting application"
        );
        self.shutting_down.store(false, Ordering::SeqCst);
        if self.options.install_panic_hook {
            install_panic_hook(Arc::clone(&self.bus), Arc::clone(&self.shutting_down));
        }

        self.container.register_instance(
            service_names::EVENT_BUS,
            ServiceInstance::from_arc(Arc::clone(&self.bus)),
        )?;
        self.container.register_instance(
            service_names::IPC_MANAGER,
            ServiceInstance::from_arc(Arc::clone(&self.ipc)),
        )?;

        self.controllers.start().await;
        self.started_at_ms.store(epoch_ms(), Ordering::SeqCst);
        self.bus.safe_emit(
            event_names::APPLICATION_STARTED,
            &[json!({"name": self.options.name, "version": self.options.version})],
        );
        info!(name = %self.options.name, "application started");
        Ok(())
    }

    /// Stop the application, unwinding components in reverse start order.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!(name = %self.options.name, "application not running");
            return;
        }

        info!(name = %self.options.name, "stopping application");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.controllers.destroy_all().await;
        self.bus.safe_emit(
            event_names::APPLICATION_STOPPED,
            &[json!({"name": self.options.name, "uptimeMs": self.uptime_ms()})],
        );
        self.ipc.destroy();
        self.container.destroy().await;
        self.bus.destroy();
        self.started_at_ms.store(0, Ordering::SeqCst);
        info!(name = %self.options.name, "application stopped");
    }

    /// Full stop-then-start cycle. Application-level services registered by
    /// the embedder are cleared with the container and must be registered
    /// again before controllers that need them reload; per-unit
    /// [`ControllerManager::reload`] is the lighter path.
    ///
    /// # Errors
    ///
    /// Same as [`Application::start`].
    pub async fn restart(&self) -> anyhow::Result<()> {
        self.stop().await;
        self.start().await
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn uptime_ms(&self) -> u64 {
        let started = self.started_at_ms.load(Ordering::SeqCst);
        if started == 0 {
            0
        } else {
            epoch_ms().saturating_sub(started)
        }
    }

    fn process_memory_bytes(&self) -> u64 {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0;
        };
        let mut system = self.system.lock();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map_or(0, sysinfo::Process::memory)
    }

    /// Snapshot of every component's counters plus process memory.
    #[must_use]
    pub fn get_status(&self) -> Value {
        json!({
            "name": self.options.name,
            "version": self.options.version,
            "running": self.is_running(),
            "uptimeMs": self.uptime_ms(),
            "memoryBytes": self.process_memory_bytes(),
            "controllers": self.controllers.get_stats(),
            "ipc": self.ipc.get_stats(),
            "container": self.container.get_stats(),
            "events": self.bus.get_stats(),
        })
    }

    /// Threshold-based health verdict: `healthy` with no findings,
    /// `warning` on resource findings, `unhealthy` when a controller sits in
    /// the error state.
    #[must_use]
    pub fn health_check(&self) -> Value {
        let mut issues: Vec<String> = Vec::new();

        let memory = self.process_memory_bytes();
        if memory > self.options.config.memory_warn_bytes {
            issues.push(format!("memory usage above threshold ({memory} bytes)"));
        }

        let ipc_stats = self.ipc.get_stats();
        let error_rate = ipc_stats.error_rate_percent();
        if error_rate > self.options.config.max_error_rate_percent {
            issues.push(format!("ipc error rate at {error_rate:.1}%"));
        }

        let controller_stats = self.controllers.get_stats();
        let errored = controller_stats.failed.len()
            + controller_stats
                .by_state
                .get(&ControllerState::Error)
                .copied()
                .unwrap_or(0);
        if errored > 0 {
            issues.push(format!("{errored} controller(s) failed"));
        }

        let status = if errored > 0 {
            "unhealthy"
        } else if issues.is_empty() {
            "healthy"
        } else {
            "warning"
        };
        json!({
            "status": status,
            "issues": issues,
            "uptimeMs": self.uptime_ms(),
            "timestamp": epoch_ms(),
        })
    }

    /// Dispatch performance: aggregate stats, the recent call window, and
    /// the slowest recorded calls.
    #[must_use]
    pub fn get_performance_info(&self) -> Value {
        json!({
            "stats": self.ipc.get_stats(),
            "recent": self.ipc.get_performance_records(None, 50),
            "slow": self.ipc.get_slow_calls(10),
        })
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.options.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Chain a reporting hook in front of the existing panic hook so panics
/// reach the log and the bus before default handling.
fn install_panic_hook(bus: Arc<EventBus>, shutting_down: Arc<AtomicBool>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        report_panic(&bus, &shutting_down, &panic_info.to_string());
        previous(panic_info);
    }));
}

/// Log a panic and surface it on the bus, unless the application is tearing
/// down. Panics raised by components mid-shutdown have nowhere to go and
/// would only add noise.
fn report_panic(bus: &EventBus, shutting_down: &AtomicBool, message: &str) {
    if shutting_down.load(Ordering::SeqCst) {
        return;
    }
    error!(panic = %message, "unhandled panic");
    bus.safe_emit(
        event_names::ERROR_OCCURRED,
        &[json!({"error": message, "code": "PANIC", "timestamp": epoch_ms()})],
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::controller::{Controller, ControllerContext, RouteDef};
    use crate::ipc::Handler;

    fn options() -> ApplicationOptions {
        ApplicationOptions {
            name: "test-app".to_string(),
            // The hook is process-global; tests leave it alone.
            install_panic_hook: false,
            ..ApplicationOptions::default()
        }
    }

    struct EchoUnit {
        fail_init: bool,
    }

    #[async_trait]
    impl Controller for EchoUnit {
        fn name(&self) -> &str {
            "echo"
        }

        fn routes(&self) -> Vec<RouteDef> {
            vec![RouteDef::new(
                "echo:run",
                Handler::from_fn(|args| async move { Ok(Value::Array(args)) }),
            )]
        }

        async fn before_init(&self, _ctx: &ControllerContext) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("wiring failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_wires_core_services_and_controllers() {
        let app = Application::new(options());
        app.controllers().define(
            "echo",
            Arc::new(|_| Ok(Arc::new(EchoUnit { fail_init: false }) as _)),
        );
        app.start().await.unwrap();

        assert!(app.is_running());
        assert!(app.container().has(service_names::EVENT_BUS));
        assert!(app.container().has(service_names::IPC_MANAGER));
        let result = app.ipc().invoke("echo:run", vec![json!(1)]).await.unwrap();
        assert_eq!(result, json!([1]));

        let history = app.bus().get_event_history(Some(event_names::APPLICATION_STARTED), 10);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn double_start_is_idempotent() {
        let app = Application::new(options());
        app.start().await.unwrap();
        app.start().await.unwrap();
        let history = app.bus().get_event_history(Some(event_names::APPLICATION_STARTED), 10);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn stop_unwinds_everything() {
        let app = Application::new(options());
        app.controllers().define(
            "echo",
            Arc::new(|_| Ok(Arc::new(EchoUnit { fail_init: false }) as _)),
        );
        app.start().await.unwrap();
        app.stop().await;

        assert!(!app.is_running());
        assert!(!app.ipc().has_channel("echo:run"));
        assert!(!app.container().has(service_names::EVENT_BUS));
        assert_eq!(app.uptime_ms(), 0);
    }

    #[tokio::test]
    async fn health_reports_unhealthy_when_a_unit_fails() {
        let mut opts = options();
        // Memory findings would need a real threshold breach; keep it out of
        // the way so the controller finding is what we assert on.
        opts.config.memory_warn_bytes = u64::MAX;
        let app = Application::new(opts);
        app.controllers().define(
            "echo",
            Arc::new(|_| Ok(Arc::new(EchoUnit { fail_init: true }) as _)),
        );
        app.start().await.unwrap();

        let health = app.health_check();
        assert_eq!(health["status"], json!("unhealthy"));
        assert!(health["issues"].as_array().is_some_and(|i| !i.is_empty()));
    }

    #[test]
    fn panic_reports_are_suppressed_during_shutdown() {
        let bus = EventBus::default();
        let shutting_down = AtomicBool::new(false);

        report_panic(&bus, &shutting_down, "worker died");
        let history = bus.get_event_history(Some(event_names::ERROR_OCCURRED), 10);
        assert_eq!(history.len(), 1);

        shutting_down.store(true, Ordering::SeqCst);
        report_panic(&bus, &shutting_down, "late panic");
        let history = bus.get_event_history(Some(event_names::ERROR_OCCURRED), 10);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn status_exposes_component_counters() {
        let app = Application::new(options());
        app.start().await.unwrap();
        let status = app.get_status();
        assert_eq!(status["name"], json!("test-app"));
        assert_eq!(status["running"], json!(true));
        assert!(status["ipc"]["total_calls"].is_u64());
        assert!(status["controllers"]["hosted"].is_u64());
    }
}
