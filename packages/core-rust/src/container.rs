//! Dependency container: named service registry with singleton/transient
//! lifetimes, cycle detection, and lifecycle-managed teardown.
//!
//! Services are registered under string names and resolved into
//! [`ServiceInstance`] handles that carry both a lifecycle view
//! (`Arc<dyn Service>`) and a typed view (`Arc<dyn Any>`) so consumers can
//! downcast to the concrete type.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::bus::{event_names, EventBus};
use crate::error::ContainerError;
use crate::time::epoch_ms;

// ---------------------------------------------------------------------------
// Service trait and ServiceInstance
// ---------------------------------------------------------------------------

/// Lifecycle hook contract for container-managed instances.
///
/// Most services need no teardown and take the default no-op `destroy`; the
/// container invokes the hook for every cached instance when it is removed or
/// the container itself is destroyed.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shim giving plain values a no-op lifecycle so they can live in the
/// container without implementing [`Service`] themselves.
struct Plain;

#[async_trait]
impl Service for Plain {}

/// A resolved service: one concrete value exposed through two erased views.
///
/// `downcast` goes through the `Any` view; the container drives teardown
/// through the `Service` view. Cloning is cheap (two `Arc`s).
#[derive(Clone)]
pub struct ServiceInstance {
    service: Arc<dyn Service>,
    any: Arc<dyn Any + Send + Sync>,
}

impl ServiceInstance {
    /// Wrap a value that participates in the destroy lifecycle.
    pub fn new<T: Service>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an already-shared service.
    pub fn from_arc<T: Service>(value: Arc<T>) -> Self {
        Self {
            service: Arc::clone(&value) as Arc<dyn Service>,
            any: value,
        }
    }

    /// Wrap a plain value with no teardown hook.
    pub fn from_value<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            service: Arc::new(Plain),
            any: Arc::new(value),
        }
    }

    /// Typed view of the instance, if `T` is its concrete type.
    #[must_use]
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.any).downcast::<T>().ok()
    }

    pub(crate) fn lifecycle(&self) -> &Arc<dyn Service> {
        &self.service
    }
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInstance").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registration model
// ---------------------------------------------------------------------------

/// Extra key/value context threaded through a resolution chain into
/// factories.
pub type ResolveContext = HashMap<String, Value>;

/// A declared dependency: a bare service name, or a name plus additional
/// context merged into the resolution chain for that subtree.
#[derive(Clone, Debug)]
pub enum DependencyRef {
    Name(String),
    Scoped { name: String, context: ResolveContext },
}

impl From<&str> for DependencyRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl DependencyRef {
    fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Scoped { name, .. } => name,
        }
    }
}

/// Constructor invoked with the resolved dependencies (in declaration order)
/// and the resolution context.
pub type ServiceFactory =
    Arc<dyn Fn(Vec<ServiceInstance>, &ResolveContext) -> anyhow::Result<ServiceInstance> + Send + Sync>;

enum ServiceImpl {
    Factory(ServiceFactory),
    Instance(ServiceInstance),
}

/// Registration options. Defaults match the common case: an eager singleton
/// with no dependencies.
#[derive(Clone, Default)]
pub struct RegisterOptions {
    pub dependencies: Vec<DependencyRef>,
    pub transient: bool,
    pub lazy: bool,
}

struct Registration {
    implementation: ServiceImpl,
    dependencies: Vec<DependencyRef>,
    singleton: bool,
    registered_at_ms: u64,
}

/// Counters exposed by [`DiContainer::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStats {
    pub total_services: usize,
    pub instances: usize,
    pub resolving: usize,
}

// ---------------------------------------------------------------------------
// DiContainer
// ---------------------------------------------------------------------------

/// Named-dependency registry.
///
/// Resolution recursively constructs declared dependencies, detects cycles
/// by tracking the in-flight name set, and caches singleton instances for the
/// container's lifetime. Eager (non-lazy) singletons are resolved at
/// registration time so configuration errors surface at startup, not first
/// use.
pub struct DiContainer {
    services: DashMap<String, Registration>,
    instances: DashMap<String, ServiceInstance>,
    resolving: Mutex<HashSet<String>>,
    bus: Arc<EventBus>,
}

impl DiContainer {
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            services: DashMap::new(),
            instances: DashMap::new(),
            resolving: Mutex::new(HashSet::new()),
            bus,
        }
    }

    /// Register a factory-constructed service.
    ///
    /// # Errors
    ///
    /// Eager singletons are resolved immediately; any construction failure is
    /// returned here instead of at first use.
    pub fn register_factory(
        &self,
        name: &str,
        factory: ServiceFactory,
        options: RegisterOptions,
    ) -> Result<(), ContainerError> {
        self.register(name, ServiceImpl::Factory(factory), options)
    }

    /// Register an existing instance. Always a singleton; the instance is
    /// returned as-is on every resolve.
    ///
    /// # Errors
    ///
    /// Currently infallible for instances; kept fallible for signature
    /// symmetry with factory registration.
    pub fn register_instance(
        &self,
        name: &str,
        instance: ServiceInstance,
    ) -> Result<(), ContainerError> {
        self.register(
            name,
            ServiceImpl::Instance(instance),
            RegisterOptions::default(),
        )
    }

    /// Register an eager singleton factory (the default shape).
    ///
    /// # Errors
    ///
    /// Same as [`DiContainer::register_factory`].
    pub fn register_singleton(
        &self,
        name: &str,
        factory: ServiceFactory,
        dependencies: Vec<DependencyRef>,
    ) -> Result<(), ContainerError> {
        self.register_factory(
            name,
            factory,
            RegisterOptions {
                dependencies,
                ..RegisterOptions::default()
            },
        )
    }

    /// Register a transient service: a fresh instance per resolve.
    ///
    /// # Errors
    ///
    /// Same as [`DiContainer::register_factory`].
    pub fn register_transient(
        &self,
        name: &str,
        factory: ServiceFactory,
        dependencies: Vec<DependencyRef>,
    ) -> Result<(), ContainerError> {
        self.register_factory(
            name,
            factory,
            RegisterOptions {
                dependencies,
                transient: true,
                // Transients are constructed per call; eager resolution would
                // produce a throwaway instance.
                lazy: true,
            },
        )
    }

    fn register(
        &self,
        name: &str,
        implementation: ServiceImpl,
        options: RegisterOptions,
    ) -> Result<(), ContainerError> {
        let singleton = !options.transient;
        let lazy = options.lazy;
        let needs_eager = singleton && !lazy && matches!(implementation, ServiceImpl::Factory(_));

        self.services.insert(
            name.to_string(),
            Registration {
                implementation,
                dependencies: options.dependencies,
                singleton,
                registered_at_ms: epoch_ms(),
            },
        );

        debug!(service = name, singleton, lazy, "service registered");
        self.bus.safe_emit(
            event_names::SERVICE_REGISTERED,
            &[json!({"name": name, "singleton": singleton, "lazy": lazy})],
        );

        if needs_eager {
            self.resolve(name, &ResolveContext::new())?;
        }
        Ok(())
    }

    /// Resolve `name` into an instance.
    ///
    /// # Errors
    ///
    /// [`ContainerError::NotFound`] for unregistered names,
    /// [`ContainerError::CircularDependency`] when `name` is already
    /// mid-resolution on this chain, [`ContainerError::Construction`] when a
    /// factory fails.
    pub fn resolve(
        &self,
        name: &str,
        context: &ResolveContext,
    ) -> Result<ServiceInstance, ContainerError> {
        if !self.services.contains_key(name) {
            return Err(ContainerError::NotFound(name.to_string()));
        }

        if let Some(instance) = self.cached_singleton(name) {
            return Ok(instance);
        }

        {
            let mut resolving = self.resolving.lock();
            if !resolving.insert(name.to_string()) {
                return Err(ContainerError::CircularDependency(name.to_string()));
            }
        }

        let result = self.construct(name, context);
        self.resolving.lock().remove(name);

        match result {
            Ok(instance) => {
                self.bus
                    .safe_emit(event_names::SERVICE_RESOLVED, &[json!({"name": name})]);
                Ok(instance)
            }
            Err(err) => {
                error!(service = name, error = %err, "service resolution failed");
                Err(err)
            }
        }
    }

    fn cached_singleton(&self, name: &str) -> Option<ServiceInstance> {
        let singleton = self.services.get(name).is_some_and(|reg| reg.singleton);
        if singleton {
            self.instances.get(name).map(|entry| entry.value().clone())
        } else {
            None
        }
    }

    fn construct(
        &self,
        name: &str,
        context: &ResolveContext,
    ) -> Result<ServiceInstance, ContainerError> {
        // Snapshot what we need so no DashMap guard is held across the
        // recursive dependency resolution below.
        let (dependencies, singleton) = {
            let registration = self
                .services
                .get(name)
                .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
            (registration.dependencies.clone(), registration.singleton)
        };

        let mut resolved = Vec::with_capacity(dependencies.len());
        for dependency in &dependencies {
            let instance = match dependency {
                DependencyRef::Name(dep_name) => self.resolve(dep_name, context)?,
                DependencyRef::Scoped {
                    name: dep_name,
                    context: extra,
                } => {
                    let mut merged = context.clone();
                    merged.extend(extra.clone());
                    self.resolve(dep_name, &merged)?
                }
            };
            resolved.push(instance);
        }

        // Snapshot again rather than holding a guard across the factory
        // call, which may itself reach back into the container.
        let implementation = {
            let registration = self
                .services
                .get(name)
                .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
            match &registration.implementation {
                ServiceImpl::Instance(instance) => ServiceImpl::Instance(instance.clone()),
                ServiceImpl::Factory(factory) => ServiceImpl::Factory(Arc::clone(factory)),
            }
        };
        let instance = match implementation {
            ServiceImpl::Instance(instance) => instance,
            ServiceImpl::Factory(factory) => {
                factory(resolved, context).map_err(|source| ContainerError::Construction {
                    name: name.to_string(),
                    source,
                })?
            }
        };

        if singleton {
            self.instances.insert(name.to_string(), instance.clone());
        }
        Ok(instance)
    }

    /// Resolve and downcast in one step.
    ///
    /// # Errors
    ///
    /// Resolution errors, plus [`ContainerError::Construction`] when the
    /// resolved instance is not a `T`.
    pub fn resolve_as<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ContainerError> {
        let instance = self.resolve(name, &ResolveContext::new())?;
        instance
            .downcast::<T>()
            .ok_or_else(|| ContainerError::Construction {
                name: name.to_string(),
                source: anyhow::anyhow!(
                    "service is not a {}",
                    std::any::type_name::<T>()
                ),
            })
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    #[must_use]
    pub fn get_service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Introspection record for one registration, or `None` if absent.
    #[must_use]
    pub fn get_service_info(&self, name: &str) -> Option<Value> {
        self.services.get(name).map(|registration| {
            json!({
                "name": name,
                "singleton": registration.singleton,
                "dependencies": registration
                    .dependencies
                    .iter()
                    .map(|dep| dep.name().to_string())
                    .collect::<Vec<_>>(),
                "registered_at_ms": registration.registered_at_ms,
                "has_instance": self.instances.contains_key(name),
            })
        })
    }

    /// Unregister `name`, running its cached instance's destroy hook first.
    pub async fn remove(&self, name: &str) {
        if let Some((_, instance)) = self.instances.remove(name) {
            if let Err(err) = instance.lifecycle().destroy().await {
                error!(service = name, error = %err, "service destroy hook failed");
            }
        }
        self.services.remove(name);
        debug!(service = name, "service removed");
        self.bus
            .safe_emit(event_names::SERVICE_REMOVED, &[json!({"name": name})]);
    }

    #[must_use]
    pub fn get_stats(&self) -> ContainerStats {
        ContainerStats {
            total_services: self.services.len(),
            instances: self.instances.len(),
            resolving: self.resolving.lock().len(),
        }
    }

    /// Destroy the container: run every cached instance's destroy hook (hook
    /// failures are logged and do not abort the remaining teardown), then
    /// clear all internal maps.
    pub async fn destroy(&self) {
        let cached: Vec<(String, ServiceInstance)> = self
            .instances
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (name, instance) in cached {
            if let Err(err) = instance.lifecycle().destroy().await {
                error!(service = %name, error = %err, "service destroy hook failed");
            }
        }
        self.services.clear();
        self.instances.clear();
        self.resolving.lock().clear();
        self.bus.safe_emit("container:destroyed", &[]);
    }
}

impl std::fmt::Debug for DiContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiContainer")
            .field("services", &self.services.len())
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Counter {
        serial: u32,
        destroyed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Service for Counter {
        async fn destroy(&self) -> anyhow::Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn container() -> DiContainer {
        DiContainer::new(Arc::new(EventBus::default()))
    }

    fn counter_factory(destroyed: Arc<AtomicU32>) -> ServiceFactory {
        let serial = Arc::new(AtomicU32::new(0));
        Arc::new(move |_deps, _ctx| {
            Ok(ServiceInstance::new(Counter {
                serial: serial.fetch_add(1, Ordering::SeqCst),
                destroyed: Arc::clone(&destroyed),
            }))
        })
    }

    #[test]
    fn singleton_resolves_to_identical_instance() {
        let c = container();
        c.register_singleton("counter", counter_factory(Arc::default()), vec![])
            .unwrap();

        let a = c.resolve_as::<Counter>("counter").unwrap();
        let b = c.resolve_as::<Counter>("counter").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.serial, 0);
    }

    #[test]
    fn transient_resolves_to_fresh_instances() {
        let c = container();
        c.register_transient("counter", counter_factory(Arc::default()), vec![])
            .unwrap();

        let a = c.resolve_as::<Counter>("counter").unwrap();
        let b = c.resolve_as::<Counter>("counter").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.serial, b.serial);
    }

    #[test]
    fn unregistered_name_is_not_found() {
        let err = container()
            .resolve("ghost", &ResolveContext::new())
            .unwrap_err();
        assert!(matches!(err, ContainerError::NotFound(name) if name == "ghost"));
    }

    #[test]
    fn dependency_cycle_fails_without_overflow() {
        let c = container();
        c.register_factory(
            "a",
            Arc::new(|deps, _| {
                let _ = deps;
                Ok(ServiceInstance::from_value(()))
            }),
            RegisterOptions {
                dependencies: vec!["b".into()],
                lazy: true,
                ..RegisterOptions::default()
            },
        )
        .unwrap();
        c.register_factory(
            "b",
            Arc::new(|deps, _| {
                let _ = deps;
                Ok(ServiceInstance::from_value(()))
            }),
            RegisterOptions {
                dependencies: vec!["a".into()],
                lazy: true,
                ..RegisterOptions::default()
            },
        )
        .unwrap();

        let err = c.resolve("a", &ResolveContext::new()).unwrap_err();
        assert!(matches!(err, ContainerError::CircularDependency(name) if name == "a"));
    }

    #[test]
    fn eager_singleton_surfaces_factory_error_at_registration() {
        let c = container();
        let err = c
            .register_singleton(
                "broken",
                Arc::new(|_, _| Err(anyhow::anyhow!("no database"))),
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, ContainerError::Construction { .. }));
    }

    #[test]
    fn lazy_singleton_constructs_on_first_resolve() {
        let c = container();
        let built = Arc::new(AtomicU32::new(0));
        let built2 = Arc::clone(&built);
        c.register_factory(
            "lazy",
            Arc::new(move |_, _| {
                built2.fetch_add(1, Ordering::SeqCst);
                Ok(ServiceInstance::from_value("ready".to_string()))
            }),
            RegisterOptions {
                lazy: true,
                ..RegisterOptions::default()
            },
        )
        .unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 0);
        let value = c.resolve_as::<String>("lazy").unwrap();
        assert_eq!(*value, "ready");
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn factory_receives_dependencies_in_order() {
        let c = container();
        c.register_instance("greeting", ServiceInstance::from_value("hello".to_string()))
            .unwrap();
        c.register_singleton(
            "message",
            Arc::new(|deps, _ctx| {
                let greeting = deps[0]
                    .downcast::<String>()
                    .ok_or_else(|| anyhow::anyhow!("wrong dep type"))?;
                Ok(ServiceInstance::from_value(format!("{greeting}, world")))
            }),
            vec!["greeting".into()],
        )
        .unwrap();

        let message = c.resolve_as::<String>("message").unwrap();
        assert_eq!(*message, "hello, world");
    }

    #[tokio::test]
    async fn destroy_runs_hooks_and_clears_maps() {
        let c = container();
        let destroyed = Arc::new(AtomicU32::new(0));
        c.register_singleton("counter", counter_factory(Arc::clone(&destroyed)), vec![])
            .unwrap();
        assert_eq!(c.get_stats().instances, 1);

        c.destroy().await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(c.get_stats().total_services, 0);
        assert!(!c.has("counter"));
    }

    #[tokio::test]
    async fn remove_destroys_single_instance() {
        let c = container();
        let destroyed = Arc::new(AtomicU32::new(0));
        c.register_singleton("counter", counter_factory(Arc::clone(&destroyed)), vec![])
            .unwrap();

        c.remove("counter").await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(!c.has("counter"));
    }

    #[test]
    fn scoped_dependency_merges_context() {
        let c = container();
        c.register_factory(
            "inner",
            Arc::new(|_, ctx| {
                let region = ctx
                    .get("region")
                    .and_then(Value::as_str)
                    .unwrap_or("unset")
                    .to_string();
                Ok(ServiceInstance::from_value(region))
            }),
            RegisterOptions {
                transient: true,
                lazy: true,
                ..RegisterOptions::default()
            },
        )
        .unwrap();
        c.register_factory(
            "outer",
            Arc::new(|deps, _| {
                let region = deps[0]
                    .downcast::<String>()
                    .ok_or_else(|| anyhow::anyhow!("wrong dep type"))?;
                Ok(ServiceInstance::from_value(format!("outer:{region}")))
            }),
            RegisterOptions {
                dependencies: vec![DependencyRef::Scoped {
                    name: "inner".to_string(),
                    context: ResolveContext::from([(
                        "region".to_string(),
                        json!("eu-west"),
                    )]),
                }],
                lazy: true,
                ..RegisterOptions::default()
            },
        )
        .unwrap();

        let value = c.resolve_as::<String>("outer").unwrap();
        assert_eq!(*value, "outer:eu-west");
    }
}
