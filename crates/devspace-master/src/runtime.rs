// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for devspace-master.
//!
//! [`MasterRuntime`] wires the lifecycle service to its background workers (idle checker,
//! runtime monitor) so the master can run inside an existing tokio application.
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use devspace_master::MasterRuntime;
//! use devspace_master::infrastructure::{Infrastructure, NoOpInfrastructure};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = MasterRuntime::builder()
//!         .node_id("master-1")
//!         .infrastructure(Infrastructure::NoOp(NoOpInfrastructure::new(Duration::ZERO)))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... start and stop workspaces through runtime.runtimes() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use devspace_core::repository::{InMemoryWorkspaceRepository, WorkspaceRepository};
use devspace_core::store::{ActivityStore, InMemoryStore, RuntimeStatusCache, SqliteStore};
use devspace_core::{Clock, EventBus, PermissionChecker, PermissionsManager, SystemClock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::activity::{ActivityConfig, IdleChecker, IdleCheckerConfig, WorkspaceActivityManager};
use crate::cluster::{Cluster, DiscoveryConfig, PartitionPolicy, TcpGroup, TcpGroupConfig};
use crate::config::Config;
use crate::infrastructure::docker::CliEngine;
use crate::infrastructure::kubernetes::KubectlApi;
use crate::infrastructure::{
    DockerInfrastructure, Infrastructure, InfrastructureRegistry, KubernetesFlavor,
    KubernetesInfrastructure, NoOpInfrastructure,
};
use crate::monitor::{RuntimeMonitor, RuntimeMonitorConfig};
use crate::runtimes::{RuntimesConfig, WorkspaceRuntimes};
use crate::synchronizer::StartSynchronizer;

/// Builder for creating a [`MasterRuntime`].
pub struct MasterRuntimeBuilder {
    node_id: Option<String>,
    bus: EventBus,
    cluster: Option<Cluster>,
    infrastructures: Vec<Infrastructure>,
    repository: Option<Arc<dyn WorkspaceRepository>>,
    permissions: Option<Arc<dyn PermissionChecker>>,
    activity_store: Option<Arc<dyn ActivityStore>>,
    status_cache: Option<Arc<dyn RuntimeStatusCache>>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    activity: ActivityConfig,
    idle_checker: IdleCheckerConfig,
    monitor: RuntimeMonitorConfig,
    runtimes: RuntimesConfig,
    recover: bool,
}

impl Default for MasterRuntimeBuilder {
    fn default() -> Self {
        Self {
            node_id: None,
            bus: EventBus::default(),
            cluster: None,
            infrastructures: Vec::new(),
            repository: None,
            permissions: None,
            activity_store: None,
            status_cache: None,
            clock: Arc::new(SystemClock),
            lock_timeout: Duration::from_secs(30),
            activity: ActivityConfig::default(),
            idle_checker: IdleCheckerConfig::default(),
            monitor: RuntimeMonitorConfig::default(),
            runtimes: RuntimesConfig::default(),
            recover: true,
        }
    }
}

impl MasterRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder populated from `config`: infrastructures, stores, timeouts and, when a
    /// group is configured, a joined cluster.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Self::new()
            .node_id(config.node_id.clone())
            .lock_timeout(config.lock_timeout)
            .activity_config(config.activity.clone())
            .idle_checker_config(config.idle_checker.clone())
            .runtimes_config(config.runtimes.clone());

        for name in &config.infrastructures {
            let infrastructure = match name.as_str() {
                "docker" => Infrastructure::Docker(DockerInfrastructure::new(
                    Arc::new(CliEngine::new(config.docker_binary.clone())),
                    config.docker.clone(),
                    builder.bus.clone(),
                )?),
                "kubernetes" | "openshift" => {
                    let flavor = if name == "openshift" {
                        KubernetesFlavor::OpenShift
                    } else {
                        KubernetesFlavor::Kubernetes
                    };
                    let binary = config.kubectl_binary.clone().unwrap_or_else(|| {
                        match flavor {
                            KubernetesFlavor::OpenShift => "oc",
                            KubernetesFlavor::Kubernetes => "kubectl",
                        }
                        .to_string()
                    });
                    let infrastructure = KubernetesInfrastructure::new(
                        Arc::new(KubectlApi::new(binary)),
                        flavor,
                        config.kubernetes.clone(),
                        builder.bus.clone(),
                    )?;
                    match flavor {
                        KubernetesFlavor::OpenShift => Infrastructure::OpenShift(infrastructure),
                        KubernetesFlavor::Kubernetes => Infrastructure::Kubernetes(infrastructure),
                    }
                }
                "noop" => Infrastructure::NoOp(NoOpInfrastructure::new(Duration::ZERO)),
                other => anyhow::bail!("unknown infrastructure '{other}'"),
            };
            builder = builder.infrastructure(infrastructure);
        }

        if let Some(url) = &config.database_url {
            let store = Arc::new(SqliteStore::connect(url).await?);
            info!(url = %url, "Using SQLite activity and status store");
            builder = builder
                .activity_store(store.clone())
                .status_cache(store);
        }

        if let Some(cluster) = &config.cluster {
            let discovery = DiscoveryConfig::load(&cluster.discovery_file)?;
            let policy = match cluster.policy {
                PartitionPolicy::RequireQuorum {
                    expected_members: 0,
                } => PartitionPolicy::RequireQuorum {
                    expected_members: discovery.members.len(),
                },
                policy => policy,
            };
            let (transport, deliveries) = TcpGroup::join(
                cluster.group_name.clone(),
                config.node_id.clone(),
                &discovery,
                TcpGroupConfig::default(),
            )
            .await?;
            let joined = Cluster::join(transport, deliveries, builder.bus.clone(), policy);
            builder = builder.cluster(joined);
        }

        Ok(builder)
    }

    /// Set this node's id. Ignored when a cluster is set.
    ///
    /// Default: a random uuid
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the event bus. Infrastructures must publish to the same bus.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Event bus handed to infrastructures built for this runtime.
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Set the cluster handle.
    ///
    /// Default: a single node cluster over the builder's bus
    pub fn cluster(mut self, cluster: Cluster) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Register an infrastructure (at least one is required).
    pub fn infrastructure(mut self, infrastructure: Infrastructure) -> Self {
        self.infrastructures.push(infrastructure);
        self
    }

    /// Set the workspace repository.
    ///
    /// Default: an empty in-memory repository
    pub fn repository(mut self, repository: Arc<dyn WorkspaceRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set the permission checker.
    ///
    /// Default: a [`PermissionsManager`] without entries, denying everything
    pub fn permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Set the activity store.
    ///
    /// Default: in memory
    pub fn activity_store(mut self, store: Arc<dyn ActivityStore>) -> Self {
        self.activity_store = Some(store);
        self
    }

    /// Set the runtime status cache.
    ///
    /// Default: in memory
    pub fn status_cache(mut self, cache: Arc<dyn RuntimeStatusCache>) -> Self {
        self.status_cache = Some(cache);
        self
    }

    /// Set the time source of activity tracking.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the bounded workspace lock wait.
    ///
    /// Default: 30 seconds
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the activity tracking configuration.
    pub fn activity_config(mut self, config: ActivityConfig) -> Self {
        self.activity = config;
        self
    }

    /// Set the idle checker configuration.
    pub fn idle_checker_config(mut self, config: IdleCheckerConfig) -> Self {
        self.idle_checker = config;
        self
    }

    /// Set the runtime monitor configuration.
    pub fn monitor_config(mut self, config: RuntimeMonitorConfig) -> Self {
        self.monitor = config;
        self
    }

    /// Set the lifecycle configuration.
    pub fn runtimes_config(mut self, config: RuntimesConfig) -> Self {
        self.runtimes = config;
        self
    }

    /// Whether runtimes found running on the backends are recovered on start.
    ///
    /// Default: true
    pub fn recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if no infrastructure was registered, or if a cluster is set
    /// without a shared status cache.
    pub fn build(self) -> Result<MasterRuntimeConfig> {
        if self.infrastructures.is_empty() {
            anyhow::bail!("at least one infrastructure is required");
        }
        if self.cluster.is_some() && self.status_cache.is_none() {
            anyhow::bail!("a clustered runtime requires a status cache shared by all nodes");
        }
        let mut registry = InfrastructureRegistry::new();
        for infrastructure in self.infrastructures {
            registry.register(infrastructure);
        }

        let cluster = self.cluster.unwrap_or_else(|| {
            let node_id = self
                .node_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            Cluster::single_node(node_id, self.bus.clone())
        });
        let memory = Arc::new(InMemoryStore::new());
        let activity_store = self
            .activity_store
            .unwrap_or_else(|| memory.clone() as Arc<dyn ActivityStore>);
        let status_cache = self
            .status_cache
            .unwrap_or_else(|| memory as Arc<dyn RuntimeStatusCache>);
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryWorkspaceRepository::new()) as Arc<dyn WorkspaceRepository>);
        let permissions = self
            .permissions
            .unwrap_or_else(|| {
                Arc::new(PermissionsManager::new(self.bus.clone())) as Arc<dyn PermissionChecker>
            });

        Ok(MasterRuntimeConfig {
            cluster,
            registry,
            repository,
            permissions,
            activity_store,
            status_cache,
            clock: self.clock,
            lock_timeout: self.lock_timeout,
            activity: self.activity,
            idle_checker: self.idle_checker,
            monitor: self.monitor,
            runtimes: self.runtimes,
            recover: self.recover,
        })
    }
}

/// Configuration for a [`MasterRuntime`].
pub struct MasterRuntimeConfig {
    cluster: Cluster,
    registry: InfrastructureRegistry,
    repository: Arc<dyn WorkspaceRepository>,
    permissions: Arc<dyn PermissionChecker>,
    activity_store: Arc<dyn ActivityStore>,
    status_cache: Arc<dyn RuntimeStatusCache>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    activity: ActivityConfig,
    idle_checker: IdleCheckerConfig,
    monitor: RuntimeMonitorConfig,
    runtimes: RuntimesConfig,
    recover: bool,
}

impl MasterRuntimeConfig {
    /// Start the runtime: recover running workspaces and spawn the background workers.
    pub async fn start(self) -> Result<MasterRuntime> {
        let infrastructures: Vec<&str> = self.registry.all().iter().map(|i| i.name()).collect();
        let activity =
            WorkspaceActivityManager::new(self.activity_store, self.clock, self.activity);
        let runtimes = WorkspaceRuntimes::new(
            StartSynchronizer::new(self.cluster.clone(), self.lock_timeout),
            self.registry,
            self.repository,
            self.permissions,
            self.status_cache,
            activity,
            self.runtimes,
        );

        if self.recover {
            let recovered = runtimes.recover().await;
            debug!(recovered, "Recovery finished");
        }

        let idle_checker = IdleChecker::new(self.idle_checker, runtimes.clone());
        let idle_shutdown = idle_checker.shutdown_handle();
        let idle_handle = tokio::spawn(async move {
            idle_checker.run().await;
        });

        let monitor = RuntimeMonitor::new(self.monitor, runtimes.clone());
        let monitor_shutdown = monitor.shutdown_handle();
        let monitor_handle = tokio::spawn(async move {
            monitor.run().await;
        });

        info!(
            node_id = %self.cluster.node_id(),
            clustered = self.cluster.is_clustered(),
            infrastructures = ?infrastructures,
            "MasterRuntime started"
        );

        Ok(MasterRuntime {
            cluster: self.cluster,
            runtimes,
            idle_handle,
            monitor_handle,
            idle_shutdown,
            monitor_shutdown,
        })
    }
}

/// A running master that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct MasterRuntime {
    cluster: Cluster,
    runtimes: WorkspaceRuntimes,
    idle_handle: JoinHandle<()>,
    monitor_handle: JoinHandle<()>,
    idle_shutdown: Arc<Notify>,
    monitor_shutdown: Arc<Notify>,
}

impl MasterRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> MasterRuntimeBuilder {
        MasterRuntimeBuilder::new()
    }

    /// Lifecycle service.
    pub fn runtimes(&self) -> &WorkspaceRuntimes {
        &self.runtimes
    }

    /// Cluster handle.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Local event bus.
    pub fn bus(&self) -> &EventBus {
        self.cluster.bus()
    }

    /// Gracefully shut down the runtime.
    ///
    /// New starts are refused first; running workspaces are left running and will be
    /// recovered by the next start.
    pub async fn shutdown(self) -> Result<()> {
        info!("MasterRuntime shutting down...");
        self.runtimes.refuse_start();

        self.idle_shutdown.notify_one();
        self.monitor_shutdown.notify_one();

        if let Err(e) = self.idle_handle.await {
            error!("Idle checker task panicked: {}", e);
        }
        if let Err(e) = self.monitor_handle.await {
            error!("Runtime monitor task panicked: {}", e);
        }

        self.cluster.leave().await;
        info!("MasterRuntime shutdown complete");
        Ok(())
    }

    /// Check if the background workers are still running.
    pub fn is_running(&self) -> bool {
        !self.idle_handle.is_finished() && !self.monitor_handle.is_finished()
    }
}
