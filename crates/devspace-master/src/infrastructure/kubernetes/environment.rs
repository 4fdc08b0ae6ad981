// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes projection of an [`Environment`] and its manifests.

use std::collections::BTreeMap;

use devspace_core::{Environment, InfrastructureError, RuntimeIdentity};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

const MAX_NAME: usize = 63;
const MAX_PORT_NAME: usize = 15;

fn short_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().take(5).map(|b| format!("{b:02x}")).collect()
}

fn squash(raw: &str, allowed: impl Fn(char) -> bool) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if allowed(c) { c } else { '-' };
        if !(c == '-' && out.ends_with('-')) {
            out.push(c);
        }
    }
    out.trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Shorten to `max`, keeping names unique with a hash suffix of the original.
fn bounded(value: String, original: &str, max: usize) -> String {
    if value.len() <= max {
        return value;
    }
    let hash = short_hash(original);
    let keep = max - hash.len() - 1;
    let prefix = value[..keep].trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{prefix}-{hash}")
}

/// DNS-1123 label: lowercase alphanumerics and `-`, at most 63 characters.
pub fn dns_name(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    let name = squash(&lower, |c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let name = if name.is_empty() {
        format!("x{}", short_hash(raw))
    } else {
        name
    };
    bounded(name, raw, MAX_NAME)
}

/// Valid label value: alphanumerics, `-`, `_`, `.`, at most 63 characters.
pub fn label_value(raw: &str) -> String {
    let value = squash(raw, |c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.'));
    bounded(value, raw, MAX_NAME)
}

/// Container port name: at most 15 characters.
pub fn port_name(server: &str, port: u16) -> String {
    let name = dns_name(server);
    let name: String = name.chars().take(MAX_PORT_NAME).collect();
    let name = name.trim_end_matches('-').to_string();
    if name.is_empty() || !name.chars().any(|c| c.is_ascii_lowercase()) {
        format!("p{port}")
    } else {
        name
    }
}

/// A named container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port number.
    pub port: u16,
    /// `TCP` or `UDP`.
    pub protocol: String,
    /// Application protocol of the server (http, ws, ...).
    pub server_protocol: String,
}

/// One pod per machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Pod name.
    pub name: String,
    /// Machine name.
    pub machine: String,
    /// Image reference.
    pub image: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Ports by name.
    pub ports: BTreeMap<String, PortSpec>,
    /// Memory limit in bytes.
    pub memory_limit: Option<i64>,
    /// Claim name to mount path.
    pub volume_mounts: BTreeMap<String, String>,
}

/// Service in front of one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name.
    pub name: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Pod selector.
    pub selector: BTreeMap<String, String>,
    /// Ports by name.
    pub ports: BTreeMap<String, PortSpec>,
}

/// Persistent volume claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvcSpec {
    /// Claim name.
    pub name: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Requested size (e.g. `1Gi`).
    pub size: String,
    /// Access mode.
    pub access_mode: String,
}

/// OpenShift route to a service port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Route name.
    pub name: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Target service.
    pub service: String,
    /// Target port name.
    pub target_port: String,
    /// Edge TLS termination.
    pub tls: bool,
}

/// Backend environment of the Kubernetes infrastructures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesEnvironment {
    /// Target namespace.
    pub namespace: String,
    /// Pods keyed by machine name.
    pub pods: BTreeMap<String, PodSpec>,
    /// Services keyed by name.
    pub services: BTreeMap<String, ServiceSpec>,
    /// Claims keyed by name.
    pub pvcs: BTreeMap<String, PvcSpec>,
    /// Routes keyed by name.
    pub routes: BTreeMap<String, RouteSpec>,
    /// Machine start order.
    pub ordered: Vec<String>,
}

impl KubernetesEnvironment {
    /// One unprovisioned pod per machine, in start order.
    pub fn from_environment(
        environment: &Environment,
        identity: &RuntimeIdentity,
    ) -> Result<Self, InfrastructureError> {
        let ordered = environment
            .machine_order()
            .map_err(|e| InfrastructureError::Internal(e.message))?;
        let mut pods = BTreeMap::new();
        for name in &ordered {
            let Some(machine) = environment.machines.get(name) else {
                continue;
            };
            let image = machine.image.clone().ok_or_else(|| {
                InfrastructureError::Internal(format!("Machine '{name}' has no image"))
            })?;
            pods.insert(
                name.clone(),
                PodSpec {
                    name: dns_name(&format!("{}-{}", identity.workspace_id, name)),
                    machine: name.clone(),
                    image,
                    memory_limit: machine.memory_limit,
                    ..Default::default()
                },
            );
        }
        Ok(Self {
            namespace: dns_name(&identity.infrastructure_namespace),
            pods,
            ordered,
            ..Default::default()
        })
    }
}

fn ports_json(ports: &BTreeMap<String, PortSpec>, container: bool) -> Vec<Value> {
    ports
        .iter()
        .map(|(name, p)| {
            if container {
                json!({"name": name, "containerPort": p.port, "protocol": p.protocol})
            } else {
                json!({"name": name, "port": p.port, "targetPort": p.port, "protocol": p.protocol})
            }
        })
        .collect()
}

impl PodSpec {
    /// Pod manifest.
    pub fn manifest(&self, namespace: &str) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v}))
            .collect();
        let mounts: Vec<Value> = self
            .volume_mounts
            .iter()
            .map(|(claim, path)| json!({"name": claim, "mountPath": path}))
            .collect();
        let volumes: Vec<Value> = self
            .volume_mounts
            .keys()
            .map(|claim| json!({"name": claim, "persistentVolumeClaim": {"claimName": claim}}))
            .collect();
        let mut container = json!({
            "name": dns_name(&self.machine),
            "image": self.image,
            "env": env,
            "ports": ports_json(&self.ports, true),
            "volumeMounts": mounts,
        });
        if let Some(memory) = self.memory_limit {
            container["resources"] = json!({"limits": {"memory": memory.to_string()}});
        }
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
                "labels": self.labels,
                "annotations": self.annotations,
            },
            "spec": {
                "restartPolicy": "Always",
                "containers": [container],
                "volumes": volumes,
            }
        })
    }
}

impl ServiceSpec {
    /// Service manifest.
    pub fn manifest(&self, namespace: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": self.name, "namespace": namespace, "labels": self.labels},
            "spec": {"selector": self.selector, "ports": ports_json(&self.ports, false)}
        })
    }
}

impl PvcSpec {
    /// Claim manifest.
    pub fn manifest(&self, namespace: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"name": self.name, "namespace": namespace, "labels": self.labels},
            "spec": {
                "accessModes": [self.access_mode],
                "resources": {"requests": {"storage": self.size}}
            }
        })
    }
}

impl RouteSpec {
    /// Route manifest.
    pub fn manifest(&self, namespace: &str) -> Value {
        let mut spec = json!({
            "to": {"kind": "Service", "name": self.service},
            "port": {"targetPort": self.target_port},
        });
        if self.tls {
            spec["tls"] = json!({"termination": "edge"});
        }
        json!({
            "apiVersion": "route.openshift.io/v1",
            "kind": "Route",
            "metadata": {"name": self.name, "namespace": namespace, "labels": self.labels},
            "spec": spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devspace_core::{MachineConfig, Recipe};

    #[test]
    fn test_dns_names() {
        assert_eq!(dns_name("My_Workspace--1"), "my-workspace-1");
        assert_eq!(dns_name("-x-"), "x");
        let long = "a".repeat(100);
        let name = dns_name(&long);
        assert_eq!(name.len(), 63);
        assert_ne!(name, dns_name(&"a".repeat(101)));
        assert!(dns_name("___").starts_with('x'));
    }

    #[test]
    fn test_label_values() {
        assert_eq!(label_value("alice@example.com"), "alice-example.com");
        assert!(label_value(&"u".repeat(80)).len() <= 63);
    }

    #[test]
    fn test_port_names() {
        assert_eq!(port_name("web", 8080), "web");
        assert_eq!(port_name("a-very-long-server-name", 8080).len(), 15);
        assert_eq!(port_name("8080", 8080), "p8080");
    }

    #[test]
    fn test_pod_manifest() {
        let env = Environment::new(Recipe::of_type("kubernetes"))
            .machine("dev", MachineConfig::with_image("x:latest").memory(512));
        let identity = RuntimeIdentity::new("W1", "default", "alice", "Alice");
        let k8s = KubernetesEnvironment::from_environment(&env, &identity).unwrap();
        assert_eq!(k8s.namespace, "alice");

        let manifest = k8s.pods["dev"].manifest(&k8s.namespace);
        assert_eq!(manifest["kind"], "Pod");
        assert_eq!(manifest["metadata"]["name"], "w1-dev");
        assert_eq!(manifest["spec"]["containers"][0]["image"], "x:latest");
        assert_eq!(
            manifest["spec"]["containers"][0]["resources"]["limits"]["memory"],
            "512"
        );
    }
}
