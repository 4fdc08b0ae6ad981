// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container engine interface and the CLI-backed engine.
//!
//! [`CliEngine`] drives any docker-compatible CLI (`docker`, `podman`). Creating a network
//! or volume that already exists and removing one that is already gone both succeed, so
//! every call can be retried safely.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use devspace_core::InfrastructureError;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::environment::DockerContainerConfig;

/// A container as listed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Whether the container is running.
    pub running: bool,
}

/// Container backend capability.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine identifier (e.g. "docker", "mock").
    fn engine_type(&self) -> &'static str;

    /// Create a network; succeeds if it already exists.
    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), InfrastructureError>;

    /// Remove a network; succeeds if it does not exist.
    async fn remove_network(&self, name: &str) -> Result<(), InfrastructureError>;

    /// Create a volume; succeeds if it already exists.
    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), InfrastructureError>;

    /// Remove a volume; succeeds if it does not exist.
    async fn remove_volume(&self, name: &str) -> Result<(), InfrastructureError>;

    /// Create a container and return its id.
    async fn create_container(
        &self,
        config: &DockerContainerConfig,
    ) -> Result<String, InfrastructureError>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<(), InfrastructureError>;

    /// Stop a container; succeeds if it does not exist.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), InfrastructureError>;

    /// Remove a container; succeeds if it does not exist.
    async fn remove_container(&self, id: &str) -> Result<(), InfrastructureError>;

    /// Containers carrying all of `labels`, running or not.
    async fn list_containers(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerSummary>, InfrastructureError>;
}

/// Whether an engine error message describes a temporary condition.
pub(crate) fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "cannot connect to the docker daemon",
        "tls handshake",
        "too many requests",
        "service unavailable",
        "temporarily unavailable",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

fn is_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("no such") || message.contains("not found")
}

fn is_already_exists(message: &str) -> bool {
    message.to_ascii_lowercase().contains("already exists")
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "State", default)]
    state: String,
}

/// Parse the comma separated `k=v` label list printed by `ps --format '{{json .}}'`.
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .collect()
}

/// Engine driving a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct CliEngine {
    binary: String,
}

impl CliEngine {
    /// Engine invoking `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, operation: &str, args: &[String]) -> Result<String, InfrastructureError> {
        debug!(binary = %self.binary, operation, args = ?args, "Running engine command");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                InfrastructureError::backend(
                    operation,
                    format!("failed to run {}: {}", self.binary, e),
                    false,
                )
            })?;
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

    /// Run a command, mapping a "not found" failure to success.
    async fn exec_absent_ok(
        &self,
        operation: &str,
        args: &[String],
    ) -> Result<(), InfrastructureError> {
        match self.exec(operation, args).await {
            Ok(_) => Ok(()),
            Err(InfrastructureError::Backend { message, .. }) if is_not_found(&message) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn label_args(labels: &BTreeMap<String, String>) -> Vec<String> {
        labels
            .iter()
            .flat_map(|(k, v)| ["--label".to_string(), format!("{k}={v}")])
            .collect()
    }

    fn create_args(config: &DockerContainerConfig) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), config.name.clone()];
        args.extend(Self::label_args(&config.labels));
        for (k, v) in &config.env {
            args.push("--env".into());
            args.push(format!("{k}={v}"));
        }
        for port in &config.expose {
            args.push("--expose".into());
            args.push(port.clone());
        }
        for (volume, path) in &config.volumes {
            args.push("--volume".into());
            args.push(format!("{volume}:{path}"));
        }
        if let Some(memory) = config.memory_limit {
            args.push(format!("--memory={memory}"));
        }
        if let Some(swap) = config.memory_swap_limit {
            args.push(format!("--memory-swap={swap}"));
        }
        if let Some(pids) = config.pids_limit {
            args.push(format!("--pids-limit={pids}"));
        }
        if let Some(parent) = &config.cgroup_parent {
            args.push(format!("--cgroup-parent={parent}"));
        }
        if let Some(network) = &config.network {
            args.push(format!("--network={network}"));
            for alias in &config.network_aliases {
                args.push(format!("--network-alias={alias}"));
            }
        }
        args.push(config.image.clone());
        args
    }
}

#[async_trait]
impl ContainerEngine for CliEngine {
    fn engine_type(&self) -> &'static str {
        "docker"
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), InfrastructureError> {
        let mut args = vec!["network".to_string(), "create".to_string()];
        args.extend(Self::label_args(labels));
        args.push(name.to_string());
        match self.exec("create_network", &args).await {
            Ok(_) => Ok(()),
            Err(InfrastructureError::Backend { message, .. }) if is_already_exists(&message) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_network(&self, name: &str) -> Result<(), InfrastructureError> {
        self.exec_absent_ok("remove_network", &["network".into(), "rm".into(), name.into()])
            .await
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), InfrastructureError> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        args.extend(Self::label_args(labels));
        args.push(name.to_string());
        self.exec("create_volume", &args).await.map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), InfrastructureError> {
        self.exec_absent_ok("remove_volume", &["volume".into(), "rm".into(), name.into()])
            .await
    }

    async fn create_container(
        &self,
        config: &DockerContainerConfig,
    ) -> Result<String, InfrastructureError> {
        self.exec("create_container", &Self::create_args(config))
            .await
    }

    async fn start_container(&self, id: &str) -> Result<(), InfrastructureError> {
        self.exec("start_container", &["start".into(), id.into()])
            .await
            .map(|_| ())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), InfrastructureError> {
        self.exec_absent_ok(
            "stop_container",
            &[
                "stop".into(),
                format!("--time={}", timeout.as_secs()),
                id.into(),
            ],
        )
        .await
    }

    async fn remove_container(&self, id: &str) -> Result<(), InfrastructureError> {
        self.exec_absent_ok(
            "remove_container",
            &["rm".into(), "--force".into(), "--volumes=false".into(), id.into()],
        )
        .await
    }

    async fn list_containers(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerSummary>, InfrastructureError> {
        let mut args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--no-trunc".to_string(),
            "--format={{json .}}".to_string(),
        ];
        for (k, v) in labels {
            args.push(format!("--filter=label={k}={v}"));
        }
        let stdout = self.exec("list_containers", &args).await?;
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let ps: PsLine = serde_json::from_str(line).map_err(|e| {
                    InfrastructureError::backend("list_containers", e.to_string(), false)
                })?;
                Ok(ContainerSummary {
                    id: ps.id,
                    name: ps.names,
                    labels: parse_labels(&ps.labels),
                    running: ps.state.eq_ignore_ascii_case("running"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_messages() {
        assert!(is_transient_message(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"
        ));
        assert!(is_transient_message("net/http: TLS handshake timeout"));
        assert!(!is_transient_message("pull access denied for nope"));
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels("devspace.managed=true,devspace.workspace=w1,empty=");
        assert_eq!(labels["devspace.managed"], "true");
        assert_eq!(labels["devspace.workspace"], "w1");
        assert_eq!(labels["empty"], "");
    }

    #[test]
    fn test_create_args() {
        let config = DockerContainerConfig {
            machine: "dev".into(),
            name: "w1_dev".into(),
            image: "x:latest".into(),
            memory_limit: Some(1024),
            memory_swap_limit: Some(2048),
            network: Some("devspace-w1".into()),
            network_aliases: ["dev".to_string()].into(),
            expose: ["8080/tcp".to_string()].into(),
            ..Default::default()
        };
        let args = CliEngine::create_args(&config);
        assert_eq!(&args[..3], &["create", "--name", "w1_dev"]);
        assert!(args.contains(&"--memory=1024".to_string()));
        assert!(args.contains(&"--memory-swap=2048".to_string()));
        assert!(args.contains(&"--network-alias=dev".to_string()));
        assert!(args.contains(&"8080/tcp".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("x:latest"));
    }
}
