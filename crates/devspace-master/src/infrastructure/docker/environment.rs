// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container-set projection of an [`Environment`].

use std::collections::{BTreeMap, BTreeSet};

use devspace_core::{Environment, InfrastructureError, RuntimeIdentity};
use serde::{Deserialize, Serialize};

/// Settings of one container, as submitted to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerContainerConfig {
    /// Machine this container runs.
    pub machine: String,
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Exposed ports, `port/transport`.
    pub expose: BTreeSet<String>,
    /// Named volume to mount path.
    pub volumes: BTreeMap<String, String>,
    /// Memory limit in bytes.
    pub memory_limit: Option<i64>,
    /// Memory plus swap limit in bytes.
    pub memory_swap_limit: Option<i64>,
    /// PID limit.
    pub pids_limit: Option<i64>,
    /// Cgroup parent.
    pub cgroup_parent: Option<String>,
    /// Volume paths excluded from snapshots.
    pub excluded_volumes: BTreeSet<String>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Aliases on that network.
    pub network_aliases: BTreeSet<String>,
}

/// Backend environment of the local container engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerEnvironment {
    /// Workspace network.
    pub network: Option<String>,
    /// Containers keyed by machine name.
    pub containers: BTreeMap<String, DockerContainerConfig>,
    /// Machine start order.
    pub ordered: Vec<String>,
}

/// Container name of `machine`.
pub fn container_name(identity: &RuntimeIdentity, machine: &str) -> String {
    let raw = format!("{}_{}", identity.workspace_id, machine);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

impl DockerEnvironment {
    /// One unprovisioned container per machine, in start order.
    pub fn from_environment(
        environment: &Environment,
        identity: &RuntimeIdentity,
    ) -> Result<Self, InfrastructureError> {
        let ordered = environment
            .machine_order()
            .map_err(|e| InfrastructureError::Internal(e.message))?;
        let mut containers = BTreeMap::new();
        for name in &ordered {
            let Some(machine) = environment.machines.get(name) else {
                continue;
            };
            let image = machine.image.clone().ok_or_else(|| {
                InfrastructureError::Internal(format!("Machine '{name}' has no image"))
            })?;
            containers.insert(
                name.clone(),
                DockerContainerConfig {
                    machine: name.clone(),
                    name: container_name(identity, name),
                    image,
                    memory_limit: machine.memory_limit,
                    pids_limit: machine.pids_limit,
                    ..Default::default()
                },
            );
        }
        Ok(Self {
            network: None,
            containers,
            ordered,
        })
    }

    /// Every named volume referenced by a container.
    pub fn volume_names(&self) -> BTreeSet<String> {
        self.containers
            .values()
            .flat_map(|c| c.volumes.keys().cloned())
            .collect()
    }
}
