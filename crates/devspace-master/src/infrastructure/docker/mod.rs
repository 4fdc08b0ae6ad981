// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local container engine infrastructure.
//!
//! A workspace becomes one container per machine, attached to a per-workspace network.
//! `prepare` only builds the context; the network, volumes and containers are created by
//! [`DockerRuntimeContext::start`] after the provisioner pipeline ran. A failed or
//! interrupted start removes every container it created and the network. Named volumes
//! survive both a failed start and a stop.

pub mod engine;
pub mod environment;
pub mod mock;
pub mod provisioners;

pub use self::engine::{CliEngine, ContainerEngine, ContainerSummary};
pub use self::environment::{DockerContainerConfig, DockerEnvironment};
pub use self::mock::MockEngine;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use devspace_core::events::MachineStatusEvent;
use devspace_core::status::Machine;
use devspace_core::{
    Environment, EventBus, InfrastructureError, MachineStatus, RuntimeIdentity, ValidationError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::provision::ProvisionerPipeline;
use super::retry::RetryPolicy;
use super::{identity_from_labels, identity_labels, labels, normalize_image};

/// Recipe types handled by the local engine.
pub const RECIPE_TYPES: &[&str] = &["dockerimage", "compose"];

/// Local engine settings.
#[derive(Debug, Clone)]
pub struct DockerSettings {
    /// Memory limit for machines that set none, in bytes.
    pub default_memory_limit: i64,
    /// Swap limit as a multiple of the memory limit.
    pub memory_swap_multiplier: f64,
    /// Per container PID limit, `-1` for none.
    pub pids_limit: i64,
    /// Cgroup parent for all containers.
    pub cgroup_parent: Option<String>,
    /// Volume paths excluded from snapshots.
    pub excluded_volumes: Vec<String>,
    /// Grace period before a stopping container is killed.
    pub stop_timeout: Duration,
    /// Retry schedule for engine calls.
    pub retry: RetryPolicy,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            default_memory_limit: 1024 * 1024 * 1024,
            memory_swap_multiplier: 1.0,
            pids_limit: -1,
            cgroup_parent: None,
            excluded_volumes: Vec::new(),
            stop_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared between the infrastructure and its contexts.
struct Shared {
    engine: Arc<dyn ContainerEngine>,
    settings: DockerSettings,
    pipeline: ProvisionerPipeline<DockerEnvironment>,
    bus: EventBus,
}

/// Local container engine infrastructure.
pub struct DockerInfrastructure {
    shared: Arc<Shared>,
}

impl DockerInfrastructure {
    /// Infrastructure over `engine` with the default pipeline.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        settings: DockerSettings,
        bus: EventBus,
    ) -> Result<Self, InfrastructureError> {
        let pipeline = provisioners::default_pipeline(&settings)?;
        Ok(Self::with_pipeline(engine, settings, bus, pipeline))
    }

    /// Infrastructure with a custom pipeline.
    pub fn with_pipeline(
        engine: Arc<dyn ContainerEngine>,
        settings: DockerSettings,
        bus: EventBus,
        pipeline: ProvisionerPipeline<DockerEnvironment>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                settings,
                pipeline,
                bus,
            }),
        }
    }

    /// Engine in use.
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.shared.engine
    }

    pub(crate) fn estimate(&self, environment: &Environment) -> Result<Environment, ValidationError> {
        environment.validate()?;
        let mut normalized = environment.clone();
        let recipe_image = environment
            .recipe
            .location
            .clone()
            .or_else(|| environment.recipe.content.clone());
        let single = normalized.machines.len() == 1;
        for (name, machine) in normalized.machines.iter_mut() {
            if machine.image.is_none() && single && environment.recipe.recipe_type == "dockerimage" {
                machine.image = recipe_image.clone();
            }
            let image = machine.image.as_deref().map(str::trim).unwrap_or_default();
            if image.is_empty() {
                return Err(ValidationError::new(format!(
                    "Machine '{name}' must declare an image"
                )));
            }
            machine.image = Some(normalize_image(image));
            if machine.memory_limit.is_some_and(|m| m < 0) {
                return Err(ValidationError::new(format!(
                    "Machine '{name}' has a negative memory limit"
                )));
            }
        }
        Ok(normalized)
    }

    pub(crate) async fn prepare(
        &self,
        identity: &RuntimeIdentity,
        environment: &Environment,
    ) -> Result<DockerRuntimeContext, InfrastructureError> {
        debug!(workspace_id = %identity.workspace_id, machines = environment.machines.len(), "Preparing docker runtime");
        Ok(DockerRuntimeContext {
            identity: identity.clone(),
            environment: Some(environment.clone()),
            backend: None,
            machines: Vec::new(),
            shared: self.shared.clone(),
        })
    }

    pub(crate) fn context_for(&self, identity: &RuntimeIdentity) -> DockerRuntimeContext {
        DockerRuntimeContext {
            identity: identity.clone(),
            environment: None,
            backend: None,
            machines: Vec::new(),
            shared: self.shared.clone(),
        }
    }

    pub(crate) async fn identities(&self) -> Result<Vec<RuntimeIdentity>, InfrastructureError> {
        let selector = BTreeMap::from([(labels::MANAGED.to_string(), "true".to_string())]);
        let containers = self
            .shared
            .settings
            .retry
            .run("list_containers", || self.shared.engine.list_containers(&selector))
            .await?;
        let identities: BTreeSet<RuntimeIdentity> = containers
            .iter()
            .filter(|c| c.running)
            .filter_map(|c| identity_from_labels(&c.labels))
            .collect();
        Ok(identities.into_iter().collect())
    }
}

/// Runtime of one workspace on the local engine.
pub struct DockerRuntimeContext {
    identity: RuntimeIdentity,
    environment: Option<Environment>,
    backend: Option<DockerEnvironment>,
    machines: Vec<Machine>,
    shared: Arc<Shared>,
}

impl DockerRuntimeContext {
    pub(crate) fn identity(&self) -> &RuntimeIdentity {
        &self.identity
    }

    /// Provisioned backend environment, once [`provision`](Self::provision) ran.
    pub fn backend(&self) -> Option<&DockerEnvironment> {
        self.backend.as_ref()
    }

    pub(crate) fn provision(&mut self) -> Result<(), InfrastructureError> {
        let environment = self.environment.as_ref().ok_or_else(|| {
            InfrastructureError::Internal("runtime context has no environment to provision".into())
        })?;
        let mut backend = DockerEnvironment::from_environment(environment, &self.identity)?;
        self.shared
            .pipeline
            .provision(environment, &self.identity, &mut backend)?;
        self.backend = Some(backend);
        Ok(())
    }

    fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (labels::MANAGED.to_string(), "true".to_string()),
            (labels::WORKSPACE.to_string(), self.identity.workspace_id.clone()),
        ])
    }

    fn publish_machine(&self, machine: &str, status: MachineStatus, error: Option<String>) {
        self.shared.bus.machine().publish(MachineStatusEvent {
            identity: self.identity.clone(),
            machine_name: machine.to_string(),
            status,
            error,
        });
    }

    pub(crate) async fn start(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Machine>, InfrastructureError> {
        let backend = self.backend.clone().ok_or_else(|| {
            InfrastructureError::Internal("runtime started before provisioning".into())
        })?;
        let mut created = Vec::new();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InfrastructureError::Interrupted(
                self.identity.workspace_id.clone(),
            )),
            result = self.create_all(&backend, &mut created) => result,
        };
        match outcome {
            Ok(machines) => {
                self.machines = machines.clone();
                info!(
                    workspace_id = %self.identity.workspace_id,
                    machines = machines.len(),
                    "Docker runtime started"
                );
                Ok(machines)
            }
            Err(e) => {
                warn!(workspace_id = %self.identity.workspace_id, error = %e, "Docker runtime start failed, rolling back");
                self.rollback(&backend, &created).await;
                Err(e)
            }
        }
    }

    async fn create_all(
        &self,
        backend: &DockerEnvironment,
        created: &mut Vec<String>,
    ) -> Result<Vec<Machine>, InfrastructureError> {
        let engine = &self.shared.engine;
        let retry = &self.shared.settings.retry;
        let object_labels = identity_labels(&self.identity);

        if let Some(network) = &backend.network {
            retry
                .run("create_network", || engine.create_network(network, &object_labels))
                .await?;
        }
        for volume in backend.volume_names() {
            retry
                .run("create_volume", || engine.create_volume(&volume, &object_labels))
                .await?;
        }

        let mut machines = Vec::with_capacity(backend.ordered.len());
        for name in &backend.ordered {
            let Some(container) = backend.containers.get(name) else {
                continue;
            };
            self.publish_machine(name, MachineStatus::Starting, None);
            let started = async {
                let id = retry
                    .run("create_container", || engine.create_container(container))
                    .await?;
                created.push(id.clone());
                retry
                    .run("start_container", || engine.start_container(&id))
                    .await?;
                Ok::<_, InfrastructureError>(id)
            }
            .await;
            let id = match started {
                Ok(id) => id,
                Err(e) => {
                    self.publish_machine(name, MachineStatus::Failed, Some(e.to_string()));
                    return Err(e);
                }
            };
            debug!(workspace_id = %self.identity.workspace_id, machine = %name, container_id = %id, "Machine started");
            self.publish_machine(name, MachineStatus::Running, None);
            machines.push(Machine {
                name: name.clone(),
                backend_id: id,
                status: MachineStatus::Running,
                servers: self
                    .environment
                    .as_ref()
                    .and_then(|env| env.machines.get(name))
                    .map(|m| m.servers.clone())
                    .unwrap_or_default(),
            });
        }
        Ok(machines)
    }

    async fn rollback(&self, backend: &DockerEnvironment, created: &[String]) {
        let engine = &self.shared.engine;
        let mut leftovers: Vec<String> = created.iter().rev().cloned().collect();
        // An interrupted create may have left a container that never got recorded.
        match engine.list_containers(&self.selector()).await {
            Ok(listed) => leftovers.extend(
                listed
                    .into_iter()
                    .map(|c| c.id)
                    .filter(|id| !created.contains(id)),
            ),
            Err(e) => {
                warn!(workspace_id = %self.identity.workspace_id, error = %e, "Failed to list containers during rollback");
            }
        }
        for id in &leftovers {
            if let Err(e) = engine.remove_container(id).await {
                warn!(workspace_id = %self.identity.workspace_id, container_id = %id, error = %e, "Failed to remove container during rollback");
            }
        }
        if let Some(network) = &backend.network
            && let Err(e) = engine.remove_network(network).await
        {
            warn!(workspace_id = %self.identity.workspace_id, network = %network, error = %e, "Failed to remove network during rollback");
        }
    }

    pub(crate) async fn stop(&mut self) -> Result<(), InfrastructureError> {
        let engine = &self.shared.engine;
        let retry = &self.shared.settings.retry;
        let selector = self.selector();
        let containers = retry
            .run("list_containers", || engine.list_containers(&selector))
            .await?;

        let mut first_error = None;
        for container in containers.iter().rev() {
            let machine = container
                .labels
                .get(labels::MACHINE)
                .cloned()
                .unwrap_or_else(|| container.name.clone());
            let result = async {
                retry
                    .run("stop_container", || {
                        engine.stop_container(&container.id, self.shared.settings.stop_timeout)
                    })
                    .await?;
                retry
                    .run("remove_container", || engine.remove_container(&container.id))
                    .await
            }
            .await;
            match result {
                Ok(()) => self.publish_machine(&machine, MachineStatus::Stopped, None),
                Err(e) => {
                    warn!(workspace_id = %self.identity.workspace_id, machine = %machine, error = %e, "Failed to stop machine");
                    first_error.get_or_insert(e);
                }
            }
        }

        let network = provisioners::network_name(&self.identity);
        if let Err(e) = retry
            .run("remove_network", || engine.remove_network(&network))
            .await
        {
            first_error.get_or_insert(e);
        }
        self.machines.clear();

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(workspace_id = %self.identity.workspace_id, "Docker runtime stopped");
                Ok(())
            }
        }
    }

    pub(crate) fn machines(&self) -> Vec<Machine> {
        self.machines.clone()
    }

    pub(crate) async fn is_alive(&self) -> Result<bool, InfrastructureError> {
        let containers = self.shared.engine.list_containers(&self.selector()).await?;
        let running = containers.iter().filter(|c| c.running).count();
        Ok(running > 0 && running >= self.machines.len())
    }
}
