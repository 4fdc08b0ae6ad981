// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster API interface and the CLI-backed client.
//!
//! [`KubectlApi`] drives `kubectl` or `oc`. Manifests are applied through stdin, so
//! applying the same object twice is a no-op and every call can be retried.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use devspace_core::InfrastructureError;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::infrastructure::docker::engine::is_transient_message;

/// A pod as listed by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    /// Pod name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Phase (`Pending`, `Running`, `Failed`, ...).
    pub phase: String,
}

/// Cluster capability used by the Kubernetes infrastructures.
#[async_trait]
pub trait KubernetesApi: Send + Sync {
    /// Create `namespace` unless it exists.
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), InfrastructureError>;

    /// Create or update an object.
    async fn apply(&self, namespace: &str, manifest: &Value) -> Result<(), InfrastructureError>;

    /// Delete objects of `kinds` carrying all of `selector`; succeeds if none exist.
    async fn delete_by_labels(
        &self,
        namespace: &str,
        kinds: &[&str],
        selector: &BTreeMap<String, String>,
    ) -> Result<(), InfrastructureError>;

    /// Phase of a pod, `None` if it does not exist.
    async fn pod_phase(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, InfrastructureError>;

    /// Pods in all namespaces carrying all of `selector`.
    async fn list_pods(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSummary>, InfrastructureError>;
}

fn is_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("notfound") || message.contains("not found")
}

fn is_already_exists(message: &str) -> bool {
    message.to_ascii_lowercase().contains("already exists")
}

/// `k=v,k2=v2` selector notation.
pub(crate) fn selector_arg(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn pod_summary(item: &Value) -> PodSummary {
    let metadata = &item["metadata"];
    PodSummary {
        name: metadata["name"].as_str().unwrap_or_default().to_string(),
        namespace: metadata["namespace"].as_str().unwrap_or_default().to_string(),
        labels: string_map(&metadata["labels"]),
        annotations: string_map(&metadata["annotations"]),
        phase: item["status"]["phase"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string(),
    }
}

/// Client driving `kubectl` or `oc`.
#[derive(Debug, Clone)]
pub struct KubectlApi {
    binary: String,
}

impl KubectlApi {
    /// Client invoking `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(
        &self,
        operation: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<String, InfrastructureError> {
        debug!(binary = %self.binary, operation, args = ?args, "Running cluster command");
        let spawn_error = |e: std::io::Error| {
            InfrastructureError::backend(
                operation,
                format!("failed to run {}: {}", self.binary, e),
                false,
            )
        };
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input).await.map_err(spawn_error)?;
        }
        let output = child.wait_with_output().await.map_err(spawn_error)?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(InfrastructureError::backend(
            operation,
            stderr.clone(),
            is_transient_message(&stderr),
        ))
    }
}

#[async_trait]
impl KubernetesApi for KubectlApi {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), InfrastructureError> {
        let args = vec![
            "create".to_string(),
            "namespace".to_string(),
            namespace.to_string(),
        ];
        match self.exec("ensure_namespace", &args, None).await {
            Ok(_) => Ok(()),
            Err(InfrastructureError::Backend { message, .. }) if is_already_exists(&message) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn apply(&self, namespace: &str, manifest: &Value) -> Result<(), InfrastructureError> {
        let body = serde_json::to_vec(manifest)
            .map_err(|e| InfrastructureError::Internal(e.to_string()))?;
        let args = vec![
            "apply".to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--filename=-".to_string(),
        ];
        self.exec("apply", &args, Some(body)).await.map(|_| ())
    }

    async fn delete_by_labels(
        &self,
        namespace: &str,
        kinds: &[&str],
        selector: &BTreeMap<String, String>,
    ) -> Result<(), InfrastructureError> {
        let args = vec![
            "delete".to_string(),
            kinds.join(","),
            "--namespace".to_string(),
            namespace.to_string(),
            format!("--selector={}", selector_arg(selector)),
            "--ignore-not-found=true".to_string(),
            "--wait=false".to_string(),
        ];
        self.exec("delete_by_labels", &args, None).await.map(|_| ())
    }

    async fn pod_phase(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, InfrastructureError> {
        let args = vec![
            "get".to_string(),
            "pod".to_string(),
            name.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--output=jsonpath={.status.phase}".to_string(),
        ];
        match self.exec("pod_phase", &args, None).await {
            Ok(phase) if phase.is_empty() => Ok(Some("Pending".to_string())),
            Ok(phase) => Ok(Some(phase)),
            Err(InfrastructureError::Backend { message, .. }) if is_not_found(&message) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_pods(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSummary>, InfrastructureError> {
        let args = vec![
            "get".to_string(),
            "pods".to_string(),
            "--all-namespaces".to_string(),
            format!("--selector={}", selector_arg(selector)),
            "--output=json".to_string(),
        ];
        let stdout = self.exec("list_pods", &args, None).await?;
        let list: Value = serde_json::from_str(&stdout)
            .map_err(|e| InfrastructureError::backend("list_pods", e.to_string(), false))?;
        Ok(list["items"]
            .as_array()
            .map(|items| items.iter().map(pod_summary).collect())
            .unwrap_or_default())
    }
}
