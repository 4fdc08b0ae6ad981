// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioners of the Kubernetes and OpenShift infrastructures.
//!
//! Label values must be valid Kubernetes label values, so identity labels are sanitized;
//! the raw identity is kept in pod annotations, which is what recovery reads back.

use std::collections::BTreeMap;

use devspace_core::{Environment, InfrastructureError, RuntimeIdentity};

use super::environment::{
    KubernetesEnvironment, PortSpec, PvcSpec, RouteSpec, ServiceSpec, dns_name, label_value,
    port_name,
};
use super::{KubernetesFlavor, KubernetesSettings};
use crate::infrastructure::provision::{
    ConfigurationProvisioner, ContainerSettingsProvisioner, ProvisionerPipeline, ProvisionerStep,
};
use crate::infrastructure::{identity_labels, labels};

/// Env var carrying the workspace id.
pub const ENV_WORKSPACE_ID: &str = "DEVSPACE_WORKSPACE_ID";
/// Env var carrying the machine name.
pub const ENV_MACHINE_NAME: &str = "DEVSPACE_MACHINE_NAME";

/// Sanitized identity labels, usable as a selector.
pub fn selector_labels(identity: &RuntimeIdentity) -> BTreeMap<String, String> {
    identity_labels(identity)
        .into_iter()
        .map(|(k, v)| (k, label_value(&v)))
        .collect()
}

/// Labels selecting every object of a workspace.
pub fn workspace_selector(identity: &RuntimeIdentity) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MANAGED.to_string(), "true".to_string()),
        (
            labels::WORKSPACE.to_string(),
            label_value(&identity.workspace_id),
        ),
    ])
}

/// Identity labels and annotations.
pub struct LabelsProvisioner;

impl ConfigurationProvisioner<KubernetesEnvironment> for LabelsProvisioner {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn provision(
        &self,
        _environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut KubernetesEnvironment,
    ) -> Result<(), InfrastructureError> {
        let selector = selector_labels(identity);
        let annotations = identity_labels(identity);
        for (machine, pod) in target.pods.iter_mut() {
            pod.labels.extend(selector.clone());
            pod.labels
                .insert(labels::MACHINE.to_string(), label_value(machine));
            pod.annotations.extend(annotations.clone());
            pod.annotations
                .insert(labels::MACHINE.to_string(), machine.clone());
        }
        Ok(())
    }
}

/// Machine env vars plus workspace variables.
pub struct EnvVarsProvisioner;

impl ConfigurationProvisioner<KubernetesEnvironment> for EnvVarsProvisioner {
    fn name(&self) -> &'static str {
        "env-vars"
    }

    fn provision(
        &self,
        environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut KubernetesEnvironment,
    ) -> Result<(), InfrastructureError> {
        for (machine, pod) in target.pods.iter_mut() {
            if let Some(config) = environment.machines.get(machine) {
                pod.env.extend(config.env.clone());
            }
            pod.env
                .insert(ENV_WORKSPACE_ID.into(), identity.workspace_id.clone());
            pod.env.insert(ENV_MACHINE_NAME.into(), machine.clone());
        }
        Ok(())
    }
}

/// Container ports plus one service per machine with servers.
pub struct ServersProvisioner;

impl ConfigurationProvisioner<KubernetesEnvironment> for ServersProvisioner {
    fn name(&self) -> &'static str {
        "servers"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["labels"]
    }

    fn provision(
        &self,
        environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut KubernetesEnvironment,
    ) -> Result<(), InfrastructureError> {
        let base = selector_labels(identity);
        for (machine, pod) in target.pods.iter_mut() {
            let Some(config) = environment.machines.get(machine) else {
                continue;
            };
            if config.servers.is_empty() {
                continue;
            }
            for (name, server) in &config.servers {
                pod.ports.insert(
                    port_name(name, server.port),
                    PortSpec {
                        port: server.port,
                        protocol: server.transport().to_ascii_uppercase(),
                        server_protocol: server.protocol.clone(),
                    },
                );
            }
            let selector = BTreeMap::from([
                (labels::MANAGED.to_string(), "true".to_string()),
                (
                    labels::WORKSPACE.to_string(),
                    label_value(&identity.workspace_id),
                ),
                (labels::MACHINE.to_string(), label_value(machine)),
            ]);
            let mut service_labels = base.clone();
            service_labels.insert(labels::MACHINE.to_string(), label_value(machine));
            target.services.insert(
                pod.name.clone(),
                ServiceSpec {
                    name: pod.name.clone(),
                    labels: service_labels,
                    selector,
                    ports: pod.ports.clone(),
                },
            );
        }
        Ok(())
    }
}

/// One claim per workspace volume, mounted into every machine declaring it.
pub struct PvcProvisioner {
    /// Requested size.
    pub size: String,
    /// Access mode.
    pub access_mode: String,
}

impl ConfigurationProvisioner<KubernetesEnvironment> for PvcProvisioner {
    fn name(&self) -> &'static str {
        "pvc"
    }

    fn provision(
        &self,
        environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut KubernetesEnvironment,
    ) -> Result<(), InfrastructureError> {
        let base = selector_labels(identity);
        for (machine, pod) in target.pods.iter_mut() {
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
                let claim = dns_name(&format!("{}-{}", identity.workspace_id, name));
                pod.volume_mounts.insert(claim.clone(), volume.path.clone());
                target.pvcs.entry(claim.clone()).or_insert_with(|| PvcSpec {
                    name: claim,
                    labels: base.clone(),
                    size: self.size.clone(),
                    access_mode: self.access_mode.clone(),
                });
            }
        }
        Ok(())
    }
}

/// OpenShift routes for every HTTP or websocket service port.
pub struct RoutesProvisioner;

impl ConfigurationProvisioner<KubernetesEnvironment> for RoutesProvisioner {
    fn name(&self) -> &'static str {
        "routes"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["servers"]
    }

    fn provision(
        &self,
        _environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut KubernetesEnvironment,
    ) -> Result<(), InfrastructureError> {
        let base = selector_labels(identity);
        for service in target.services.values() {
            for (port, spec) in &service.ports {
                let tls = matches!(spec.server_protocol.as_str(), "https" | "wss");
                if !tls && !matches!(spec.server_protocol.as_str(), "http" | "ws") {
                    continue;
                }
                let name = dns_name(&format!("{}-{}", service.name, port));
                target.routes.insert(
                    name.clone(),
                    RouteSpec {
                        name,
                        labels: base.clone(),
                        service: service.name.clone(),
                        target_port: port.clone(),
                        tls,
                    },
                );
            }
        }
        Ok(())
    }
}

/// Memory limit for machines that set none.
pub struct DefaultMemoryProvisioner {
    /// Limit in bytes.
    pub default_memory_limit: i64,
}

impl ContainerSettingsProvisioner<KubernetesEnvironment> for DefaultMemoryProvisioner {
    fn name(&self) -> &'static str {
        "default-memory"
    }

    fn provision(&self, target: &mut KubernetesEnvironment) -> Result<(), InfrastructureError> {
        for pod in target.pods.values_mut() {
            if pod.memory_limit.is_none_or(|m| m <= 0) {
                pod.memory_limit = Some(self.default_memory_limit);
            }
        }
        Ok(())
    }
}

/// The default pipeline for `flavor`. Routes exist only on OpenShift.
pub fn default_pipeline(
    flavor: KubernetesFlavor,
    settings: &KubernetesSettings,
) -> Result<ProvisionerPipeline<KubernetesEnvironment>, InfrastructureError> {
    let mut steps = vec![
        ProvisionerStep::configuration(LabelsProvisioner),
        ProvisionerStep::configuration(EnvVarsProvisioner),
        ProvisionerStep::configuration(ServersProvisioner),
        ProvisionerStep::configuration(PvcProvisioner {
            size: settings.pvc_size.clone(),
            access_mode: settings.pvc_access_mode.clone(),
        }),
    ];
    if flavor == KubernetesFlavor::OpenShift {
        steps.push(ProvisionerStep::configuration(RoutesProvisioner));
    }
    steps.push(ProvisionerStep::settings(DefaultMemoryProvisioner {
        default_memory_limit: settings.default_memory_limit,
    }));
    ProvisionerPipeline::new(steps)
}
