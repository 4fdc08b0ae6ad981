// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container engine for testing.
//!
//! Keeps networks, volumes and containers in memory and records every call. Faults can be
//! injected per operation name (`create_container`, `start_container`, ...).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use devspace_core::InfrastructureError;

use super::engine::{ContainerEngine, ContainerSummary};
use super::environment::DockerContainerConfig;

#[derive(Debug, Clone)]
struct Fault {
    transient: bool,
    remaining: Option<usize>,
}

/// A container held by the mock.
#[derive(Debug, Clone)]
pub struct MockContainer {
    /// Container id.
    pub id: String,
    /// Config it was created with.
    pub config: DockerContainerConfig,
    /// Whether it is running.
    pub running: bool,
}

#[derive(Debug, Default)]
struct MockState {
    networks: BTreeSet<String>,
    volumes: BTreeSet<String>,
    containers: BTreeMap<String, MockContainer>,
    calls: Vec<String>,
    faults: HashMap<String, Fault>,
    next_id: u64,
}

/// In-memory container engine.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    /// Delay applied to every `start_container` call.
    pub start_delay: Duration,
}

impl MockEngine {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose container starts take `delay`.
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` calls of `operation`.
    pub fn fail_next(&self, operation: &str, transient: bool, times: usize) {
        self.state().faults.insert(
            operation.to_string(),
            Fault {
                transient,
                remaining: Some(times),
            },
        );
    }

    /// Fail every call of `operation`.
    pub fn fail_always(&self, operation: &str, transient: bool) {
        self.state().faults.insert(
            operation.to_string(),
            Fault {
                transient,
                remaining: None,
            },
        );
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Recorded calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of recorded calls of `operation`.
    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == operation).count()
    }

    /// All containers.
    pub fn containers(&self) -> Vec<MockContainer> {
        self.state().containers.values().cloned().collect()
    }

    /// Existing networks.
    pub fn networks(&self) -> BTreeSet<String> {
        self.state().networks.clone()
    }

    /// Existing volumes.
    pub fn volumes(&self) -> BTreeSet<String> {
        self.state().volumes.clone()
    }

    /// Stop a container behind the orchestrator's back.
    pub fn kill(&self, name: &str) -> bool {
        let mut state = self.state();
        match state.containers.values_mut().find(|c| c.config.name == name) {
            Some(container) => {
                container.running = false;
                true
            }
            None => false,
        }
    }

    /// Record a call and apply an injected fault, if any.
    fn enter(&self, operation: &str) -> Result<(), InfrastructureError> {
        let mut state = self.state();
        state.calls.push(operation.to_string());
        let (transient, fire, exhausted) = match state.faults.get_mut(operation) {
            None => return Ok(()),
            Some(fault) => match fault.remaining {
                None => (fault.transient, true, false),
                Some(0) => (fault.transient, false, true),
                Some(n) => {
                    fault.remaining = Some(n - 1);
                    (fault.transient, true, n == 1)
                }
            },
        };
        if exhausted {
            state.faults.remove(operation);
        }
        if !fire {
            return Ok(());
        }
        Err(InfrastructureError::backend(
            operation,
            "injected failure",
            transient,
        ))
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn engine_type(&self) -> &'static str {
        "mock"
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<(), InfrastructureError> {
        self.enter("create_network")?;
        self.state().networks.insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), InfrastructureError> {
        self.enter("remove_network")?;
        self.state().networks.remove(name);
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<(), InfrastructureError> {
        self.enter("create_volume")?;
        self.state().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), InfrastructureError> {
        self.enter("remove_volume")?;
        self.state().volumes.remove(name);
        Ok(())
    }

    async fn create_container(
        &self,
        config: &DockerContainerConfig,
    ) -> Result<String, InfrastructureError> {
        self.enter("create_container")?;
        let mut state = self.state();
        if state.containers.values().any(|c| c.config.name == config.name) {
            return Err(InfrastructureError::backend(
                "create_container",
                format!("container name '{}' is already in use", config.name),
                false,
            ));
        }
        if let Some(network) = &config.network
            && !state.networks.contains(network)
        {
            return Err(InfrastructureError::backend(
                "create_container",
                format!("network {network} not found"),
                false,
            ));
        }
        state.next_id += 1;
        let id = format!("mock-{:08x}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                config: config.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), InfrastructureError> {
        self.enter("start_container")?;
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        match self.state().containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(InfrastructureError::backend(
                "start_container",
                format!("no such container: {id}"),
                false,
            )),
        }
    }

    async fn stop_container(
        &self,
        id: &str,
        _timeout: Duration,
    ) -> Result<(), InfrastructureError> {
        self.enter("stop_container")?;
        if let Some(container) = self.state().containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), InfrastructureError> {
        self.enter("remove_container")?;
        self.state().containers.remove(id);
        Ok(())
    }

    async fn list_containers(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerSummary>, InfrastructureError> {
        self.enter("list_containers")?;
        Ok(self
            .state()
            .containers
            .values()
            .filter(|c| labels.iter().all(|(k, v)| c.config.labels.get(k) == Some(v)))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.config.name.clone(),
                labels: c.config.labels.clone(),
                running: c.running,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let engine = MockEngine::new();
        engine.fail_next("create_network", true, 2);

        let labels = BTreeMap::new();
        assert!(engine.create_network("n", &labels).await.unwrap_err().is_transient());
        assert!(engine.create_network("n", &labels).await.is_err());
        engine.create_network("n", &labels).await.unwrap();

        assert_eq!(engine.call_count("create_network"), 3);
        assert!(engine.networks().contains("n"));
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let engine = MockEngine::new();
        let config = DockerContainerConfig {
            name: "w1_dev".into(),
            image: "x:latest".into(),
            labels: [("devspace.workspace".to_string(), "w1".to_string())].into(),
            ..Default::default()
        };
        let id = engine.create_container(&config).await.unwrap();
        assert!(engine.create_container(&config).await.is_err());
        engine.start_container(&id).await.unwrap();

        let listed = engine.list_containers(&config.labels).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].running);

        assert!(engine.kill("w1_dev"));
        let listed = engine.list_containers(&config.labels).await.unwrap();
        assert!(!listed[0].running);

        engine.remove_container(&id).await.unwrap();
        assert!(engine.containers().is_empty());
    }
}
