// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioners of the local container engine.
//!
//! Default order:
//!
//! | # | Name | Shape | Effect |
//! |---|------|-------|--------|
//! | 1 | `labels` | configuration | identity and machine labels |
//! | 2 | `env-vars` | configuration | machine env plus workspace variables |
//! | 3 | `servers` | configuration | exposed ports and server labels |
//! | 4 | `volumes` | configuration | workspace-scoped named volumes |
//! | 5 | `network` | configuration | workspace network and machine aliases |
//! | 6 | `default-memory` | settings | memory limit when the machine sets none |
//! | 7 | `cgroup` | settings | cgroup parent and swap, computed from the memory limit |
//! | 8 | `pids-limit` | settings | PID limit |
//! | 9 | `excluded-volumes` | settings | volumes skipped by snapshots |

use devspace_core::{Environment, InfrastructureError, RuntimeIdentity};

use super::DockerSettings;
use super::environment::DockerEnvironment;
use crate::infrastructure::labels;
use crate::infrastructure::provision::{
    ConfigurationProvisioner, ContainerSettingsProvisioner, ProvisionerPipeline, ProvisionerStep,
};

/// Env var carrying the workspace id.
pub const ENV_WORKSPACE_ID: &str = "DEVSPACE_WORKSPACE_ID";
/// Env var carrying the machine name.
pub const ENV_MACHINE_NAME: &str = "DEVSPACE_MACHINE_NAME";
/// Label prefix for declared servers.
pub const SERVER_LABEL_PREFIX: &str = "devspace.server.";

/// Workspace network name.
pub fn network_name(identity: &RuntimeIdentity) -> String {
    format!("devspace-{}", identity.workspace_id.to_ascii_lowercase())
}

/// Workspace-scoped volume name.
pub fn volume_name(identity: &RuntimeIdentity, volume: &str) -> String {
    format!("{}_{}", identity.workspace_id.to_ascii_lowercase(), volume)
}

/// Identity and machine labels.
pub struct LabelsProvisioner;

impl ConfigurationProvisioner<DockerEnvironment> for LabelsProvisioner {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn provision(
        &self,
        _environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut DockerEnvironment,
    ) -> Result<(), InfrastructureError> {
        let base = crate::infrastructure::identity_labels(identity);
        for (machine, container) in target.containers.iter_mut() {
            container.labels.extend(base.clone());
            container
                .labels
                .insert(labels::MACHINE.to_string(), machine.clone());
        }
        Ok(())
    }
}

/// Machine env vars plus workspace variables.
pub struct EnvVarsProvisioner;

impl ConfigurationProvisioner<DockerEnvironment> for EnvVarsProvisioner {
    fn name(&self) -> &'static str {
        "env-vars"
    }

    fn provision(
        &self,
        environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut DockerEnvironment,
    ) -> Result<(), InfrastructureError> {
        for (machine, container) in target.containers.iter_mut() {
            if let Some(config) = environment.machines.get(machine) {
                container.env.extend(config.env.clone());
            }
            container
                .env
                .insert(ENV_WORKSPACE_ID.into(), identity.workspace_id.clone());
            container
                .env
                .insert(ENV_MACHINE_NAME.into(), machine.clone());
        }
        Ok(())
    }
}

/// Exposed ports and server labels.
pub struct ServersProvisioner;

impl ConfigurationProvisioner<DockerEnvironment> for ServersProvisioner {
    fn name(&self) -> &'static str {
        "servers"
    }

    fn provision(
        &self,
        environment: &Environment,
        _identity: &RuntimeIdentity,
        target: &mut DockerEnvironment,
    ) -> Result<(), InfrastructureError> {
        for (machine, container) in target.containers.iter_mut() {
            let Some(config) = environment.machines.get(machine) else {
                continue;
            };
            for (name, server) in &config.servers {
                container.expose.insert(server.expose());
                let prefix = format!("{SERVER_LABEL_PREFIX}{name}");
                container
                    .labels
                    .insert(format!("{prefix}.port"), server.expose());
                container
                    .labels
                    .insert(format!("{prefix}.protocol"), server.protocol.clone());
                if let Some(path) = &server.path {
                    container.labels.insert(format!("{prefix}.path"), path.clone());
                }
            }
        }
        Ok(())
    }
}

/// Workspace-scoped named volumes.
pub struct VolumesProvisioner;

impl ConfigurationProvisioner<DockerEnvironment> for VolumesProvisioner {
    fn name(&self) -> &'static str {
        "volumes"
    }

    fn provision(
        &self,
        environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut DockerEnvironment,
    ) -> Result<(), InfrastructureError> {
        for (machine, container) in target.containers.iter_mut() {
            let Some(config) = environment.machines.get(machine) else {
                continue;
            };
            for (name, volume) in &config.volumes {
                if !volume.path.starts_with('/') {
                    return Err(InfrastructureError::Internal(format!(
                        "Volume '{}' of machine '{}' must have an absolute path",
                        name, machine
                    )));
                }
                container
                    .volumes
                    .insert(volume_name(identity, name), volume.path.clone());
            }
        }
        Ok(())
    }
}

/// Workspace network and machine aliases.
pub struct NetworkProvisioner;

impl ConfigurationProvisioner<DockerEnvironment> for NetworkProvisioner {
    fn name(&self) -> &'static str {
        "network"
    }

    fn provision(
        &self,
        _environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut DockerEnvironment,
    ) -> Result<(), InfrastructureError> {
        let network = network_name(identity);
        for (machine, container) in target.containers.iter_mut() {
            container.network = Some(network.clone());
            container.network_aliases.insert(machine.clone());
        }
        target.network = Some(network);
        Ok(())
    }
}

/// Memory limit for machines that set none.
pub struct DefaultMemoryProvisioner {
    /// Limit in bytes.
    pub default_memory_limit: i64,
}

impl ContainerSettingsProvisioner<DockerEnvironment> for DefaultMemoryProvisioner {
    fn name(&self) -> &'static str {
        "default-memory"
    }

    fn provision(&self, target: &mut DockerEnvironment) -> Result<(), InfrastructureError> {
        for container in target.containers.values_mut() {
            if container.memory_limit.is_none_or(|m| m <= 0) {
                container.memory_limit = Some(self.default_memory_limit);
            }
        }
        Ok(())
    }
}

/// Cgroup parent and swap limit. Reads the resolved memory limit, so it must run after
/// `default-memory`.
pub struct CgroupProvisioner {
    /// Cgroup parent, if any.
    pub cgroup_parent: Option<String>,
    /// Swap limit as a multiple of the memory limit.
    pub memory_swap_multiplier: f64,
}

impl ContainerSettingsProvisioner<DockerEnvironment> for CgroupProvisioner {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["default-memory"]
    }

    fn provision(&self, target: &mut DockerEnvironment) -> Result<(), InfrastructureError> {
        for container in target.containers.values_mut() {
            let memory = container.memory_limit.filter(|m| *m > 0).ok_or_else(|| {
                InfrastructureError::Internal(format!(
                    "Memory limit of container '{}' is not resolved",
                    container.name
                ))
            })?;
            container.memory_swap_limit = Some((memory as f64 * self.memory_swap_multiplier) as i64);
            container.cgroup_parent = self.cgroup_parent.clone();
        }
        Ok(())
    }
}

/// Per-container PID limit; `-1` leaves containers unlimited.
pub struct PidsLimitProvisioner {
    /// Limit, `-1` for none.
    pub pids_limit: i64,
}

impl ContainerSettingsProvisioner<DockerEnvironment> for PidsLimitProvisioner {
    fn name(&self) -> &'static str {
        "pids-limit"
    }

    fn provision(&self, target: &mut DockerEnvironment) -> Result<(), InfrastructureError> {
        if self.pids_limit == -1 {
            return Ok(());
        }
        for container in target.containers.values_mut() {
            if container.pids_limit.is_none() {
                container.pids_limit = Some(self.pids_limit);
            }
        }
        Ok(())
    }
}

/// Volume paths excluded from workspace snapshots.
pub struct ExcludedVolumesProvisioner {
    /// Mount paths.
    pub paths: Vec<String>,
}

impl ContainerSettingsProvisioner<DockerEnvironment> for ExcludedVolumesProvisioner {
    fn name(&self) -> &'static str {
        "excluded-volumes"
    }

    fn provision(&self, target: &mut DockerEnvironment) -> Result<(), InfrastructureError> {
        for container in target.containers.values_mut() {
            container.excluded_volumes.extend(self.paths.iter().cloned());
        }
        Ok(())
    }
}

/// The default pipeline for `settings`.
pub fn default_pipeline(
    settings: &DockerSettings,
) -> Result<ProvisionerPipeline<DockerEnvironment>, InfrastructureError> {
    ProvisionerPipeline::new(vec![
        ProvisionerStep::configuration(LabelsProvisioner),
        ProvisionerStep::configuration(EnvVarsProvisioner),
        ProvisionerStep::configuration(ServersProvisioner),
        ProvisionerStep::configuration(VolumesProvisioner),
        ProvisionerStep::configuration(NetworkProvisioner),
        ProvisionerStep::settings(DefaultMemoryProvisioner {
            default_memory_limit: settings.default_memory_limit,
        }),
        ProvisionerStep::settings(CgroupProvisioner {
            cgroup_parent: settings.cgroup_parent.clone(),
            memory_swap_multiplier: settings.memory_swap_multiplier,
        }),
        ProvisionerStep::settings(PidsLimitProvisioner {
            pids_limit: settings.pids_limit,
        }),
        ProvisionerStep::settings(ExcludedVolumesProvisioner {
            paths: settings.excluded_volumes.clone(),
        }),
    ])
}
