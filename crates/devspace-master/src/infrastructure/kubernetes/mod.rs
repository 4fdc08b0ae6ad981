// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes and OpenShift infrastructures.
//!
//! A workspace becomes one pod per machine in the owner's namespace, plus a service for
//! each machine that declares servers and, on OpenShift, a route per HTTP server. Claims
//! for workspace volumes survive a stop; everything else is deleted by label selector.

pub mod api;
pub mod environment;
pub mod mock;
pub mod provisioners;

pub use self::api::{KubectlApi, KubernetesApi, PodSummary};
pub use self::environment::KubernetesEnvironment;
pub use self::mock::MockKubernetesApi;

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

use self::environment::dns_name;
use self::provisioners::workspace_selector;
use super::provision::ProvisionerPipeline;
use super::retry::RetryPolicy;
use super::{identity_from_labels, labels, normalize_image};

/// Recipe types handled by the Kubernetes infrastructure.
pub const KUBERNETES_RECIPE_TYPES: &[&str] = &["kubernetes"];
/// Recipe types handled by the OpenShift infrastructure.
pub const OPENSHIFT_RECIPE_TYPES: &[&str] = &["openshift"];

/// Kinds removed on stop. Claims are kept.
const RUNTIME_KINDS: &[&str] = &["pod", "service"];
const OPENSHIFT_RUNTIME_KINDS: &[&str] = &["pod", "service", "route"];

/// Cluster flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubernetesFlavor {
    /// Plain Kubernetes.
    Kubernetes,
    /// OpenShift, with routes.
    OpenShift,
}

impl KubernetesFlavor {
    fn runtime_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Kubernetes => RUNTIME_KINDS,
            Self::OpenShift => OPENSHIFT_RUNTIME_KINDS,
        }
    }
}

/// Kubernetes settings.
#[derive(Debug, Clone)]
pub struct KubernetesSettings {
    /// Memory limit for machines that set none, in bytes.
    pub default_memory_limit: i64,
    /// Size requested by volume claims.
    pub pvc_size: String,
    /// Access mode of volume claims.
    pub pvc_access_mode: String,
    /// Interval between pod phase checks while starting.
    pub poll_interval: Duration,
    /// Retry schedule for API calls.
    pub retry: RetryPolicy,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            default_memory_limit: 1024 * 1024 * 1024,
            pvc_size: "1Gi".to_string(),
            pvc_access_mode: "ReadWriteOnce".to_string(),
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

struct Shared {
    api: Arc<dyn KubernetesApi>,
    flavor: KubernetesFlavor,
    settings: KubernetesSettings,
    pipeline: ProvisionerPipeline<KubernetesEnvironment>,
    bus: EventBus,
}

/// Kubernetes or OpenShift infrastructure.
pub struct KubernetesInfrastructure {
    shared: Arc<Shared>,
}

impl KubernetesInfrastructure {
    /// Infrastructure over `api` with the default pipeline of `flavor`.
    pub fn new(
        api: Arc<dyn KubernetesApi>,
        flavor: KubernetesFlavor,
        settings: KubernetesSettings,
        bus: EventBus,
    ) -> Result<Self, InfrastructureError> {
        let pipeline = provisioners::default_pipeline(flavor, &settings)?;
        Ok(Self {
            shared: Arc::new(Shared {
                api,
                flavor,
                settings,
                pipeline,
                bus,
            }),
        })
    }

    /// Cluster flavor.
    pub fn flavor(&self) -> KubernetesFlavor {
        self.shared.flavor
    }

    pub(crate) fn estimate(&self, environment: &Environment) -> Result<Environment, ValidationError> {
        environment.validate()?;
        let mut normalized = environment.clone();
        for (name, machine) in normalized.machines.iter_mut() {
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
        let mut pods = BTreeSet::new();
        for name in normalized.machines.keys() {
            if !pods.insert(dns_name(name)) {
                return Err(ValidationError::new(format!(
                    "Machine name '{name}' collides with another machine once sanitized"
                )));
            }
        }
        Ok(normalized)
    }

    pub(crate) async fn prepare(
        &self,
        identity: &RuntimeIdentity,
        environment: &Environment,
    ) -> Result<KubernetesRuntimeContext, InfrastructureError> {
        debug!(workspace_id = %identity.workspace_id, machines = environment.machines.len(), "Preparing kubernetes runtime");
        Ok(KubernetesRuntimeContext {
            identity: identity.clone(),
            environment: Some(environment.clone()),
            backend: None,
            machines: Vec::new(),
            shared: self.shared.clone(),
        })
    }

    pub(crate) fn context_for(&self, identity: &RuntimeIdentity) -> KubernetesRuntimeContext {
        KubernetesRuntimeContext {
            identity: identity.clone(),
            environment: None,
            backend: None,
            machines: Vec::new(),
            shared: self.shared.clone(),
        }
    }

    pub(crate) async fn identities(&self) -> Result<Vec<RuntimeIdentity>, InfrastructureError> {
        let selector = BTreeMap::from([(labels::MANAGED.to_string(), "true".to_string())]);
        let pods = self
            .shared
            .settings
            .retry
            .run("list_pods", || self.shared.api.list_pods(&selector))
            .await?;
        let identities: BTreeSet<RuntimeIdentity> = pods
            .iter()
            .filter(|p| p.phase == "Running")
            .filter_map(|p| identity_from_labels(&p.annotations))
            .collect();
        Ok(identities.into_iter().collect())
    }
}

/// Runtime of one workspace on a Kubernetes cluster.
pub struct KubernetesRuntimeContext {
    identity: RuntimeIdentity,
    environment: Option<Environment>,
    backend: Option<KubernetesEnvironment>,
    machines: Vec<Machine>,
    shared: Arc<Shared>,
}

impl KubernetesRuntimeContext {
    pub(crate) fn identity(&self) -> &RuntimeIdentity {
        &self.identity
    }

    /// Provisioned backend environment, once [`provision`](Self::provision) ran.
    pub fn backend(&self) -> Option<&KubernetesEnvironment> {
        self.backend.as_ref()
    }

    fn namespace(&self) -> String {
        dns_name(&self.identity.infrastructure_namespace)
    }

    fn interrupted(&self) -> InfrastructureError {
        InfrastructureError::Interrupted(self.identity.workspace_id.clone())
    }

    pub(crate) fn provision(&mut self) -> Result<(), InfrastructureError> {
        let environment = self.environment.as_ref().ok_or_else(|| {
            InfrastructureError::Internal("runtime context has no environment to provision".into())
        })?;
        let mut backend = KubernetesEnvironment::from_environment(environment, &self.identity)?;
        self.shared
            .pipeline
            .provision(environment, &self.identity, &mut backend)?;
        self.backend = Some(backend);
        Ok(())
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
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.interrupted()),
            result = self.create_all(&backend) => result,
        };
        match outcome {
            Ok(machines) => {
                self.machines = machines.clone();
                info!(
                    workspace_id = %self.identity.workspace_id,
                    namespace = %backend.namespace,
                    machines = machines.len(),
                    "Kubernetes runtime started"
                );
                Ok(machines)
            }
            Err(e) => {
                warn!(workspace_id = %self.identity.workspace_id, error = %e, "Kubernetes runtime start failed, rolling back");
                if let Err(cleanup) = self.delete_runtime_objects(&backend.namespace).await {
                    warn!(workspace_id = %self.identity.workspace_id, error = %cleanup, "Failed to remove objects during rollback");
                }
                Err(e)
            }
        }
    }

    async fn create_all(
        &self,
        backend: &KubernetesEnvironment,
    ) -> Result<Vec<Machine>, InfrastructureError> {
        let api = &self.shared.api;
        let retry = &self.shared.settings.retry;
        let namespace = backend.namespace.as_str();

        retry
            .run("ensure_namespace", || api.ensure_namespace(namespace))
            .await?;
        for pvc in backend.pvcs.values() {
            let manifest = pvc.manifest(namespace);
            retry.run("apply", || api.apply(namespace, &manifest)).await?;
        }

        let mut machines = Vec::with_capacity(backend.ordered.len());
        for name in &backend.ordered {
            let Some(pod) = backend.pods.get(name) else {
                continue;
            };
            self.publish_machine(name, MachineStatus::Starting, None);
            let started = async {
                if let Some(service) = backend.services.get(&pod.name) {
                    let manifest = service.manifest(namespace);
                    retry.run("apply", || api.apply(namespace, &manifest)).await?;
                }
                let manifest = pod.manifest(namespace);
                retry.run("apply", || api.apply(namespace, &manifest)).await?;
                self.wait_running(namespace, &pod.name).await
            }
            .await;
            if let Err(e) = started {
                self.publish_machine(name, MachineStatus::Failed, Some(e.to_string()));
                return Err(e);
            }
            debug!(workspace_id = %self.identity.workspace_id, machine = %name, pod = %pod.name, "Machine started");
            self.publish_machine(name, MachineStatus::Running, None);
            machines.push(Machine {
                name: name.clone(),
                backend_id: format!("{}/{}", namespace, pod.name),
                status: MachineStatus::Running,
                servers: self
                    .environment
                    .as_ref()
                    .and_then(|env| env.machines.get(name))
                    .map(|m| m.servers.clone())
                    .unwrap_or_default(),
            });
        }
        for route in backend.routes.values() {
            let manifest = route.manifest(namespace);
            retry.run("apply", || api.apply(namespace, &manifest)).await?;
        }
        Ok(machines)
    }

    async fn wait_running(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<(), InfrastructureError> {
        let api = &self.shared.api;
        loop {
            let phase = self
                .shared
                .settings
                .retry
                .run("pod_phase", || api.pod_phase(namespace, pod))
                .await?;
            match phase.as_deref() {
                Some("Running") => return Ok(()),
                Some(phase @ ("Failed" | "Succeeded")) => {
                    return Err(InfrastructureError::backend(
                        "start_pod",
                        format!("pod {pod} entered phase {phase}"),
                        false,
                    ));
                }
                None => {
                    return Err(InfrastructureError::backend(
                        "start_pod",
                        format!("pod {pod} disappeared while starting"),
                        false,
                    ));
                }
                Some(_) => tokio::time::sleep(self.shared.settings.poll_interval).await,
            }
        }
    }

    async fn delete_runtime_objects(&self, namespace: &str) -> Result<(), InfrastructureError> {
        let selector = workspace_selector(&self.identity);
        let kinds = self.shared.flavor.runtime_kinds();
        self.shared
            .settings
            .retry
            .run("delete_by_labels", || {
                self.shared.api.delete_by_labels(namespace, kinds, &selector)
            })
            .await
    }

    pub(crate) async fn stop(&mut self) -> Result<(), InfrastructureError> {
        let namespace = self.namespace();
        let selector = workspace_selector(&self.identity);
        let pods = self
            .shared
            .settings
            .retry
            .run("list_pods", || self.shared.api.list_pods(&selector))
            .await?;
        self.delete_runtime_objects(&namespace).await?;
        for pod in pods.iter().filter(|p| p.namespace == namespace) {
            let machine = pod
                .annotations
                .get(labels::MACHINE)
                .cloned()
                .unwrap_or_else(|| pod.name.clone());
            self.publish_machine(&machine, MachineStatus::Stopped, None);
        }
        self.machines.clear();
        info!(workspace_id = %self.identity.workspace_id, namespace = %namespace, "Kubernetes runtime stopped");
        Ok(())
    }

    pub(crate) fn machines(&self) -> Vec<Machine> {
        self.machines.clone()
    }

    pub(crate) async fn is_alive(&self) -> Result<bool, InfrastructureError> {
        let namespace = self.namespace();
        let pods = self
            .shared
            .api
            .list_pods(&workspace_selector(&self.identity))
            .await?;
        let running = pods
            .iter()
            .filter(|p| p.namespace == namespace && p.phase == "Running")
            .count();
        Ok(running > 0 && running >= self.machines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devspace_core::{MachineConfig, Recipe};

    fn settings() -> KubernetesSettings {
        KubernetesSettings {
            poll_interval: Duration::from_millis(5),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
            ..KubernetesSettings::default()
        }
    }

    fn setup(flavor: KubernetesFlavor) -> (KubernetesInfrastructure, MockKubernetesApi) {
        let api = MockKubernetesApi::new();
        let infra =
            KubernetesInfrastructure::new(Arc::new(api.clone()), flavor, settings(), EventBus::default())
                .unwrap();
        (infra, api)
    }

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity::new("w1", "default", "alice@example.com", "alice")
    }

    fn environment(recipe: &str) -> Environment {
        Environment::new(Recipe::of_type(recipe))
            .machine(
                "dev",
                MachineConfig::with_image("dev-image")
                    .server("web", "3000/http")
                    .unwrap()
                    .volume("projects", "/projects")
                    .depends_on("db"),
            )
            .machine("db", MachineConfig::with_image("postgres:16"))
    }

    async fn started(infra: &KubernetesInfrastructure, recipe: &str) -> KubernetesRuntimeContext {
        let env = infra.estimate(&environment(recipe)).unwrap();
        let mut ctx = infra.prepare(&identity(), &env).await.unwrap();
        ctx.provision().unwrap();
        ctx.start(&CancellationToken::new()).await.unwrap();
        ctx
    }

    #[test]
    fn test_estimate_requires_images() {
        let (infra, _) = setup(KubernetesFlavor::Kubernetes);
        let env = Environment::new(Recipe::of_type("kubernetes"))
            .machine("dev", MachineConfig::default());
        assert!(infra.estimate(&env).unwrap_err().message.contains("image"));

        let env = infra.estimate(&environment("kubernetes")).unwrap();
        assert_eq!(env.machines["dev"].image.as_deref(), Some("dev-image:latest"));
    }

    #[test]
    fn test_estimate_rejects_colliding_names() {
        let (infra, _) = setup(KubernetesFlavor::Kubernetes);
        let env = Environment::new(Recipe::of_type("kubernetes"))
            .machine("dev_1", MachineConfig::with_image("x"))
            .machine("dev.1", MachineConfig::with_image("x"));
        assert!(infra.estimate(&env).unwrap_err().message.contains("collides"));
    }

    #[tokio::test]
    async fn test_start_applies_objects() {
        let (infra, api) = setup(KubernetesFlavor::Kubernetes);
        let ctx = started(&infra, "kubernetes").await;

        assert!(api.namespaces().contains("alice"));
        assert_eq!(api.objects("Pod").len(), 2);
        assert_eq!(api.objects("Service").len(), 1);
        assert_eq!(api.objects("PersistentVolumeClaim").len(), 1);
        assert!(api.objects("Route").is_empty());
        assert_eq!(
            ctx.machines().iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            vec!["db", "dev"]
        );
        assert!(ctx.is_alive().await.unwrap());
        assert_eq!(infra.identities().await.unwrap(), vec![identity()]);
    }

    #[tokio::test]
    async fn test_openshift_creates_routes() {
        let (infra, api) = setup(KubernetesFlavor::OpenShift);
        let _ctx = started(&infra, "openshift").await;
        assert_eq!(api.objects("Route").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_pod_rolls_back() {
        let (infra, api) = setup(KubernetesFlavor::Kubernetes);
        api.set_pod_phase("w1-dev", "Failed");
        let env = infra.estimate(&environment("kubernetes")).unwrap();
        let mut ctx = infra.prepare(&identity(), &env).await.unwrap();
        ctx.provision().unwrap();
        let err = ctx.start(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("Failed"));
        assert!(api.objects("Pod").is_empty());
        assert!(api.objects("Service").is_empty());
        assert_eq!(api.objects("PersistentVolumeClaim").len(), 1);
    }

    #[tokio::test]
    async fn test_pending_pod_observes_cancel() {
        let (infra, api) = setup(KubernetesFlavor::Kubernetes);
        api.set_pod_phase("w1-db", "Pending");
        let env = infra.estimate(&environment("kubernetes")).unwrap();
        let mut ctx = infra.prepare(&identity(), &env).await.unwrap();
        ctx.provision().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let err = ctx.start(&cancel).await.unwrap_err();
        assert!(matches!(err, InfrastructureError::Interrupted(_)));
        assert!(api.objects("Pod").is_empty());
    }

    #[tokio::test]
    async fn test_stop_through_recovered_context_keeps_claims() {
        let (infra, api) = setup(KubernetesFlavor::OpenShift);
        let _ctx = started(&infra, "openshift").await;

        let mut recovered = infra.context_for(&identity());
        recovered.stop().await.unwrap();
        assert!(api.objects("Pod").is_empty());
        assert!(api.objects("Service").is_empty());
        assert!(api.objects("Route").is_empty());
        assert_eq!(api.objects("PersistentVolumeClaim").len(), 1);
        assert!(infra.identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_pod_is_not_alive() {
        let (infra, api) = setup(KubernetesFlavor::Kubernetes);
        let ctx = started(&infra, "kubernetes").await;
        assert!(api.kill("w1-db"));
        assert!(!ctx.is_alive().await.unwrap());
    }
}
