//! Controller registry: declared definitions, ordered startup with per-unit
//! failure isolation, and reverse-order teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::bus::{event_names, EventBus};
use crate::container::DiContainer;
use crate::controller::{
    Controller, ControllerContext, ControllerHost, ControllerInfo, ControllerState,
};
use crate::error::ControllerError;
use crate::ipc::IpcManager;

/// Builds a controller from the lifecycle context. Runs once per start or
/// reload of the unit.
pub type ControllerFactory =
    Arc<dyn Fn(&ControllerContext) -> anyhow::Result<Arc<dyn Controller>> + Send + Sync>;

#[derive(Clone)]
struct ControllerDefinition {
    id: String,
    factory: ControllerFactory,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub defined: usize,
    pub hosted: usize,
    pub ready: usize,
    pub by_state: HashMap<ControllerState, usize>,
    pub controllers: Vec<ControllerInfo>,
    /// Ids whose last start or reload failed. These units are not hosted;
    /// they come back through [`ControllerManager::reload`].
    pub failed: Vec<String>,
}

/// Drives the set of controllers as a group.
///
/// Definitions are started in declaration order; a unit that fails to build
/// or initialize is logged and skipped without affecting the rest. Teardown
/// walks the hosted units in reverse start order.
pub struct ControllerManager {
    definitions: RwLock<Vec<ControllerDefinition>>,
    hosts: RwLock<Vec<(String, Arc<ControllerHost>)>>,
    failed: RwLock<Vec<String>>,
    bus: Arc<EventBus>,
    container: Arc<DiContainer>,
    ipc: Arc<IpcManager>,
    started: AtomicBool,
}

impl ControllerManager {
    #[must_use]
    pub fn new(bus: Arc<EventBus>, container: Arc<DiContainer>, ipc: Arc<IpcManager>) -> Self {
        Self {
            definitions: RwLock::new(Vec::new()),
            hosts: RwLock::new(Vec::new()),
            failed: RwLock::new(Vec::new()),
            bus,
            container,
            ipc,
            started: AtomicBool::new(false),
        }
    }

    /// Declare a controller under `id`. Redefining an id replaces the
    /// earlier factory and logs a warning; an already-running unit keeps its
    /// old behavior until reloaded.
    pub fn define(&self, id: &str, factory: ControllerFactory) {
        let mut definitions = self.definitions.write();
        if let Some(existing) = definitions.iter_mut().find(|d| d.id == id) {
            warn!(controller = id, "controller definition replaced");
            existing.factory = factory;
        } else {
            definitions.push(ControllerDefinition {
                id: id.to_string(),
                factory,
            });
        }
    }

    /// Ids of every declared definition, in declaration order.
    #[must_use]
    pub fn discover(&self) -> Vec<String> {
        self.definitions.read().iter().map(|d| d.id.clone()).collect()
    }

    fn context(&self) -> ControllerContext {
        ControllerContext::new(Arc::clone(&self.bus), Arc::clone(&self.container))
    }

    /// Build and initialize every defined unit, in declaration order.
    ///
    /// Per-unit failures are contained: the failing unit is reported on the
    /// bus and the remaining units still come up. Calling `start` on an
    /// already started manager is a warning no-op.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("controller manager already started");
            return;
        }

        let definitions: Vec<ControllerDefinition> = self.definitions.read().clone();
        let ctx = self.context();
        for definition in definitions {
            if let Err(err) = self.bring_up(&definition, &ctx).await {
                error!(controller = %definition.id, error = %err, "controller failed to start");
                self.bus.safe_emit(
                    event_names::ERROR_OCCURRED,
                    &[json!({"error": err.to_string(), "controller": definition.id})],
                );
            }
        }

        let stats = self.get_stats();
        info!(
            ready = stats.ready,
            defined = stats.defined,
            "controllers started"
        );
    }

    async fn bring_up(
        &self,
        definition: &ControllerDefinition,
        ctx: &ControllerContext,
    ) -> Result<(), ControllerError> {
        match self.build_and_init(definition, ctx).await {
            Ok(host) => {
                self.hosts.write().push((definition.id.clone(), host));
                self.failed.write().retain(|failed| failed != &definition.id);
                Ok(())
            }
            Err(err) => {
                let mut failed = self.failed.write();
                if !failed.contains(&definition.id) {
                    failed.push(definition.id.clone());
                }
                Err(err)
            }
        }
    }

    /// Build and initialize one unit. It joins the hosted list only once
    /// init succeeds; failed units stay out of the listing and come back
    /// through [`reload`](Self::reload).
    async fn build_and_init(
        &self,
        definition: &ControllerDefinition,
        ctx: &ControllerContext,
    ) -> Result<Arc<ControllerHost>, ControllerError> {
        let controller = (definition.factory)(ctx).map_err(|source| ControllerError::Load {
            id: definition.id.clone(),
            source,
        })?;
        let host = Arc::new(ControllerHost::new(
            controller,
            Arc::clone(&self.ipc),
            Arc::clone(&self.bus),
        ));
        host.initialize(ctx).await?;
        Ok(host)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ControllerHost>> {
        self.hosts
            .read()
            .iter()
            .find(|(host_id, _)| host_id == id)
            .map(|(_, host)| Arc::clone(host))
    }

    /// Tear down and rebuild one unit from its current definition.
    ///
    /// # Errors
    ///
    /// [`ControllerError::Unknown`] when no definition carries this id,
    /// otherwise build or init failures for the fresh instance.
    pub async fn reload(&self, id: &str) -> Result<(), ControllerError> {
        let definition = self
            .definitions
            .read()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| ControllerError::Unknown { id: id.to_string() })?;

        let old = {
            let mut hosts = self.hosts.write();
            hosts
                .iter()
                .position(|(host_id, _)| host_id == id)
                .map(|position| hosts.remove(position).1)
        };
        if let Some(old) = old {
            old.destroy().await;
        }

        info!(controller = id, "reloading controller");
        let ctx = self.context();
        self.bring_up(&definition, &ctx).await
    }

    #[must_use]
    pub fn get_stats(&self) -> RegistryStats {
        let hosts = self.hosts.read();
        let mut by_state: HashMap<ControllerState, usize> = HashMap::new();
        let mut controllers = Vec::with_capacity(hosts.len());
        for (_, host) in hosts.iter() {
            *by_state.entry(host.state()).or_insert(0) += 1;
            controllers.push(host.info());
        }
        RegistryStats {
            defined: self.definitions.read().len(),
            hosted: hosts.len(),
            ready: by_state
                .get(&ControllerState::Ready)
                .copied()
                .unwrap_or(0),
            by_state,
            controllers,
            failed: self.failed.read().clone(),
        }
    }

    /// Destroy every hosted unit in reverse start order. The manager can be
    /// started again afterwards.
    pub async fn destroy_all(&self) {
        let hosts: Vec<(String, Arc<ControllerHost>)> =
            self.hosts.write().drain(..).rev().collect();
        for (id, host) in hosts {
            info!(controller = %id, "destroying controller");
            host.destroy().await;
        }
        self.failed.write().clear();
        self.started.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ControllerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerManager")
            .field("defined", &self.definitions.read().len())
            .field("hosted", &self.hosts.read().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
