// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime infrastructures.
//!
//! An [`Infrastructure`] is one of a closed set of backend variants. Each variant offers the
//! same two capabilities:
//!
//! - `estimate` validates an [`Environment`] against the backend's constraints and returns a
//!   normalized copy. Nothing is allocated.
//! - `prepare` allocates nothing that runs code yet and returns a [`RuntimeContext`]. The
//!   context runs the backend's provisioner pipeline and then creates and starts the
//!   containers.
//!
//! The [`InfrastructureRegistry`] selects the variant by recipe type.

pub mod docker;
pub mod kubernetes;
pub mod noop;
pub mod provision;
pub mod retry;

pub use self::docker::{DockerInfrastructure, DockerRuntimeContext, DockerSettings};
pub use self::kubernetes::{
    KubernetesFlavor, KubernetesInfrastructure, KubernetesRuntimeContext, KubernetesSettings,
};
pub use self::noop::{NoOpInfrastructure, NoOpRuntimeContext};
pub use self::provision::{
    ConfigurationProvisioner, ContainerSettingsProvisioner, ProvisionerPipeline, ProvisionerStep,
};
pub use self::retry::RetryPolicy;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use devspace_core::status::Machine;
use devspace_core::{Environment, InfrastructureError, RuntimeIdentity, ValidationError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Labels put on every backend object of a workspace.
pub mod labels {
    /// Marks objects created by devspace.
    pub const MANAGED: &str = "devspace.managed";
    /// Workspace id.
    pub const WORKSPACE: &str = "devspace.workspace";
    /// Environment name.
    pub const ENV: &str = "devspace.env";
    /// Owner id.
    pub const OWNER: &str = "devspace.owner";
    /// Infrastructure namespace.
    pub const NAMESPACE: &str = "devspace.namespace";
    /// Machine name.
    pub const MACHINE: &str = "devspace.machine";
}

/// Identity labels for `identity`.
pub fn identity_labels(identity: &RuntimeIdentity) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MANAGED.to_string(), "true".to_string()),
        (labels::WORKSPACE.to_string(), identity.workspace_id.clone()),
        (labels::ENV.to_string(), identity.env_name.clone()),
        (labels::OWNER.to_string(), identity.owner_id.clone()),
        (
            labels::NAMESPACE.to_string(),
            identity.infrastructure_namespace.clone(),
        ),
    ])
}

/// Rebuild an identity from object labels.
pub fn identity_from_labels(labels: &BTreeMap<String, String>) -> Option<RuntimeIdentity> {
    if labels.get(labels::MANAGED).map(String::as_str) != Some("true") {
        return None;
    }
    Some(RuntimeIdentity::new(
        labels.get(labels::WORKSPACE)?.clone(),
        labels.get(labels::ENV)?.clone(),
        labels.get(labels::OWNER)?.clone(),
        labels.get(labels::NAMESPACE)?.clone(),
    ))
}

/// Append `:latest` to an image reference without tag or digest.
pub(crate) fn normalize_image(image: &str) -> String {
    let image = image.trim();
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') || image.contains('@') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

/// Backend variants.
pub enum Infrastructure {
    /// Local container engine.
    Docker(DockerInfrastructure),
    /// Kubernetes cluster.
    Kubernetes(KubernetesInfrastructure),
    /// OpenShift cluster; Kubernetes plus routes.
    OpenShift(KubernetesInfrastructure),
    /// No backend; machines exist only in memory.
    NoOp(NoOpInfrastructure),
}

impl Infrastructure {
    /// Infrastructure name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker(_) => "docker",
            Self::Kubernetes(_) => "kubernetes",
            Self::OpenShift(_) => "openshift",
            Self::NoOp(_) => "noop",
        }
    }

    /// Recipe types this infrastructure accepts.
    pub fn recipe_types(&self) -> &'static [&'static str] {
        match self {
            Self::Docker(_) => docker::RECIPE_TYPES,
            Self::Kubernetes(_) => kubernetes::KUBERNETES_RECIPE_TYPES,
            Self::OpenShift(_) => kubernetes::OPENSHIFT_RECIPE_TYPES,
            Self::NoOp(_) => noop::RECIPE_TYPES,
        }
    }

    /// Validate `environment` and return its normalized form.
    pub fn estimate(&self, environment: &Environment) -> Result<Environment, ValidationError> {
        let recipe_type = environment.recipe.recipe_type.as_str();
        if !self.recipe_types().contains(&recipe_type) {
            return Err(ValidationError::new(format!(
                "Recipe type '{}' is not supported by infrastructure '{}'",
                recipe_type,
                self.name()
            )));
        }
        match self {
            Self::Docker(infra) => infra.estimate(environment),
            Self::Kubernetes(infra) | Self::OpenShift(infra) => infra.estimate(environment),
            Self::NoOp(infra) => infra.estimate(environment),
        }
    }

    /// Build a runtime context for `identity`. No containers are created yet.
    pub async fn prepare(
        &self,
        identity: &RuntimeIdentity,
        environment: &Environment,
    ) -> Result<RuntimeContext, InfrastructureError> {
        Ok(match self {
            Self::Docker(infra) => {
                RuntimeContext::Docker(infra.prepare(identity, environment).await?)
            }
            Self::Kubernetes(infra) | Self::OpenShift(infra) => {
                RuntimeContext::Kubernetes(infra.prepare(identity, environment).await?)
            }
            Self::NoOp(infra) => RuntimeContext::NoOp(infra.prepare(identity, environment)),
        })
    }

    /// Context able to stop a runtime this process did not start.
    pub fn context_for(&self, identity: &RuntimeIdentity) -> RuntimeContext {
        match self {
            Self::Docker(infra) => RuntimeContext::Docker(infra.context_for(identity)),
            Self::Kubernetes(infra) | Self::OpenShift(infra) => {
                RuntimeContext::Kubernetes(infra.context_for(identity))
            }
            Self::NoOp(infra) => RuntimeContext::NoOp(infra.context_for(identity)),
        }
    }

    /// Identities of runtimes currently running on the backend.
    pub async fn identities(&self) -> Result<Vec<RuntimeIdentity>, InfrastructureError> {
        match self {
            Self::Docker(infra) => infra.identities().await,
            Self::Kubernetes(infra) | Self::OpenShift(infra) => infra.identities().await,
            Self::NoOp(infra) => Ok(infra.identities()),
        }
    }
}

/// A prepared runtime of one workspace.
pub enum RuntimeContext {
    /// Local container engine runtime.
    Docker(DockerRuntimeContext),
    /// Kubernetes or OpenShift runtime.
    Kubernetes(KubernetesRuntimeContext),
    /// No-op runtime.
    NoOp(NoOpRuntimeContext),
}

impl RuntimeContext {
    /// Identity of the runtime.
    pub fn identity(&self) -> &RuntimeIdentity {
        match self {
            Self::Docker(ctx) => ctx.identity(),
            Self::Kubernetes(ctx) => ctx.identity(),
            Self::NoOp(ctx) => ctx.identity(),
        }
    }

    /// Run the backend provisioner pipeline.
    pub fn provision(&mut self) -> Result<(), InfrastructureError> {
        match self {
            Self::Docker(ctx) => ctx.provision(),
            Self::Kubernetes(ctx) => ctx.provision(),
            Self::NoOp(ctx) => ctx.provision(),
        }
    }

    /// Create and start every machine. Cancelling `cancel` abandons the backend call in
    /// flight; on failure or cancellation everything created so far is removed again.
    pub async fn start(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Machine>, InfrastructureError> {
        match self {
            Self::Docker(ctx) => ctx.start(cancel).await,
            Self::Kubernetes(ctx) => ctx.start(cancel).await,
            Self::NoOp(ctx) => ctx.start(cancel).await,
        }
    }

    /// Stop and remove every machine.
    pub async fn stop(&mut self) -> Result<(), InfrastructureError> {
        match self {
            Self::Docker(ctx) => ctx.stop().await,
            Self::Kubernetes(ctx) => ctx.stop().await,
            Self::NoOp(ctx) => ctx.stop(),
        }
    }

    /// Machines started by this context.
    pub fn machines(&self) -> Vec<Machine> {
        match self {
            Self::Docker(ctx) => ctx.machines(),
            Self::Kubernetes(ctx) => ctx.machines(),
            Self::NoOp(ctx) => ctx.machines(),
        }
    }

    /// Whether every machine is still running on the backend.
    pub async fn is_alive(&self) -> Result<bool, InfrastructureError> {
        match self {
            Self::Docker(ctx) => ctx.is_alive().await,
            Self::Kubernetes(ctx) => ctx.is_alive().await,
            Self::NoOp(ctx) => Ok(ctx.is_alive()),
        }
    }
}

/// Infrastructures keyed by the recipe types they accept.
#[derive(Clone, Default)]
pub struct InfrastructureRegistry {
    by_recipe: HashMap<String, Arc<Infrastructure>>,
    infrastructures: Vec<Arc<Infrastructure>>,
}

impl InfrastructureRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `infrastructure` for all its recipe types. A later registration for the
    /// same recipe type wins.
    pub fn register(&mut self, infrastructure: Infrastructure) -> Arc<Infrastructure> {
        let infrastructure = Arc::new(infrastructure);
        self.infrastructures
            .retain(|i| i.name() != infrastructure.name());
        for recipe_type in infrastructure.recipe_types() {
            if let Some(previous) = self
                .by_recipe
                .insert(recipe_type.to_string(), infrastructure.clone())
                && previous.name() != infrastructure.name()
            {
                warn!(
                    recipe_type,
                    previous = previous.name(),
                    infrastructure = infrastructure.name(),
                    "Recipe type registered twice, later registration wins"
                );
            }
        }
        self.infrastructures.push(infrastructure.clone());
        infrastructure
    }

    /// Infrastructure handling `recipe_type`.
    pub fn for_recipe(&self, recipe_type: &str) -> Option<&Arc<Infrastructure>> {
        self.by_recipe.get(recipe_type)
    }

    /// Infrastructure by name.
    pub fn by_name(&self, name: &str) -> Option<&Arc<Infrastructure>> {
        self.infrastructures.iter().find(|i| i.name() == name)
    }

    /// Every registered infrastructure.
    pub fn all(&self) -> &[Arc<Infrastructure>] {
        &self.infrastructures
    }

    /// Every supported recipe type, sorted.
    pub fn recipe_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_recipe.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devspace_core::environment::Recipe;
    use devspace_core::{EventBus, MachineConfig};
    use std::time::Duration;

    fn noop() -> Infrastructure {
        Infrastructure::NoOp(NoOpInfrastructure::new(Duration::ZERO))
    }

    #[test]
    fn test_image_normalization() {
        assert_eq!(normalize_image("ubuntu"), "ubuntu:latest");
        assert_eq!(normalize_image("ubuntu:22.04"), "ubuntu:22.04");
        assert_eq!(
            normalize_image("registry:5000/team/app"),
            "registry:5000/team/app:latest"
        );
        assert_eq!(normalize_image("app@sha256:abc"), "app@sha256:abc");
    }

    #[test]
    fn test_identity_labels_roundtrip() {
        let identity = RuntimeIdentity::new("w1", "default", "alice", "alice-ns");
        let labels = identity_labels(&identity);
        assert_eq!(identity_from_labels(&labels), Some(identity));

        let mut foreign = labels.clone();
        foreign.remove(labels::MANAGED);
        assert_eq!(identity_from_labels(&foreign), None);
    }

    #[test]
    fn test_registry_selects_by_recipe_type() {
        let mut registry = InfrastructureRegistry::new();
        registry.register(noop());
        registry.register(Infrastructure::Docker(DockerInfrastructure::new(
            Arc::new(docker::MockEngine::new()),
            DockerSettings::default(),
            EventBus::default(),
        )
        .unwrap()));

        assert_eq!(registry.for_recipe("noop").unwrap().name(), "noop");
        assert_eq!(registry.for_recipe("dockerimage").unwrap().name(), "docker");
        assert_eq!(registry.for_recipe("compose").unwrap().name(), "docker");
        assert!(registry.for_recipe("helm").is_none());
        assert_eq!(registry.all().len(), 2);
        assert_eq!(registry.recipe_types(), vec!["compose", "dockerimage", "noop"]);

        registry.register(noop());
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_estimate_rejects_foreign_recipe() {
        let env = Environment::new(Recipe::of_type("kubernetes"))
            .machine("dev", MachineConfig::with_image("x"));
        let err = noop().estimate(&env).unwrap_err();
        assert!(err.message.contains("not supported"));
    }
}
