// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for devspace-master integration tests.
//!
//! Provides a shared world (stores, repository, permissions, no-op backend, manual clock)
//! and helpers building single nodes or an in-process cluster on top of it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use devspace_core::permissions::{Acl, WORKSPACE_DOMAIN, actions};
use devspace_core::repository::InMemoryWorkspaceRepository;
use devspace_core::store::InMemoryStore;
use devspace_core::{
    Environment, EventBus, MachineConfig, ManualClock, PermissionsManager, Recipe, Subject,
    WorkspaceConfig,
};
use devspace_master::activity::ActivityConfig;
use devspace_master::cluster::{MemoryGroup, PartitionPolicy};
use devspace_master::infrastructure::NoOpInfrastructure;
use devspace_master::{
    Cluster, Infrastructure, InfrastructureRegistry, RuntimesConfig, StartSynchronizer,
    WorkspaceActivityManager, WorkspaceRuntimes,
};

/// Owner of every test workspace.
pub const OWNER: &str = "alice";

/// State shared by every node of a test: what a real deployment keeps in the database,
/// the workspace repository and the container backend.
pub struct World {
    pub store: Arc<InMemoryStore>,
    pub repository: InMemoryWorkspaceRepository,
    pub permissions: PermissionsManager,
    pub noop: NoOpInfrastructure,
    pub clock: ManualClock,
    pub lock_timeout: Duration,
}

/// One master node.
pub struct Node {
    pub runtimes: WorkspaceRuntimes,
    pub cluster: Cluster,
    pub bus: EventBus,
}

impl World {
    /// Empty world whose starts take `start_delay`.
    pub fn new(start_delay: Duration) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            repository: InMemoryWorkspaceRepository::new(),
            permissions: PermissionsManager::new(EventBus::default()),
            noop: NoOpInfrastructure::new(start_delay),
            clock: ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()),
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// Register a workspace owned by [`OWNER`] who may run it.
    pub async fn add_workspace(&self, id: &str, idle_timeout_secs: Option<u64>) {
        self.repository.put(workspace(id, idle_timeout_secs)).await;
        self.permissions
            .store(
                Acl::user(WORKSPACE_DOMAIN, Some(id), OWNER, &[actions::READ, actions::RUN]),
                None,
            )
            .await
            .unwrap();
    }

    /// A node on its own.
    pub fn single_node(&self, node_id: &str) -> Node {
        let bus = EventBus::default();
        self.node(Cluster::single_node(node_id, bus.clone()), bus)
    }

    /// A node on its own that shares the stores but has no infrastructure registered.
    pub fn bare_node(&self, node_id: &str) -> Node {
        let bus = EventBus::default();
        self.node_with(
            Cluster::single_node(node_id, bus.clone()),
            bus,
            InfrastructureRegistry::new(),
        )
    }

    /// Join `node_ids` to a fresh in-memory group and wait until every node sees the others.
    pub async fn cluster(
        &self,
        group_name: &str,
        node_ids: &[&str],
        policy: PartitionPolicy,
    ) -> (MemoryGroup, Vec<Node>) {
        let group = MemoryGroup::new(group_name);
        let joined: Vec<_> = node_ids.iter().map(|id| group.join(*id)).collect();
        let nodes = joined
            .into_iter()
            .map(|(transport, deliveries)| {
                let bus = EventBus::default();
                let cluster = Cluster::join(transport, deliveries, bus.clone(), policy);
                self.node(cluster, bus)
            })
            .collect();
        settle().await;
        (group, nodes)
    }

    fn node(&self, cluster: Cluster, bus: EventBus) -> Node {
        let mut registry = InfrastructureRegistry::new();
        registry.register(Infrastructure::NoOp(self.noop.clone()));
        self.node_with(cluster, bus, registry)
    }

    fn node_with(&self, cluster: Cluster, bus: EventBus, registry: InfrastructureRegistry) -> Node {
        let activity = WorkspaceActivityManager::new(
            self.store.clone(),
            Arc::new(self.clock.clone()),
            ActivityConfig::default(),
        );
        let runtimes = WorkspaceRuntimes::new(
            StartSynchronizer::new(cluster.clone(), self.lock_timeout),
            registry,
            Arc::new(self.repository.clone()),
            Arc::new(self.permissions.clone()),
            self.store.clone(),
            activity,
            RuntimesConfig::default(),
        );
        Node {
            runtimes,
            cluster,
            bus,
        }
    }
}

/// Workspace with one machine on the no-op recipe.
pub fn workspace(id: &str, idle_timeout_secs: Option<u64>) -> WorkspaceConfig {
    WorkspaceConfig {
        id: id.to_string(),
        name: id.to_string(),
        namespace: OWNER.into(),
        owner_id: OWNER.into(),
        default_env: "default".into(),
        environments: BTreeMap::from([(
            "default".to_string(),
            Environment::new(Recipe::of_type("noop")).machine("dev", MachineConfig::with_image("x")),
        )]),
        attributes: BTreeMap::new(),
        idle_timeout_secs,
    }
}

/// The workspace owner.
pub fn owner() -> Subject {
    Subject::new(OWNER)
}

/// Let dispatchers process pending view changes and messages.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Drain every event currently queued on a receiver.
pub fn drain<E: Clone>(rx: &mut tokio::sync::broadcast::Receiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
