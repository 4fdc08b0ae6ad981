// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Infrastructure without a backend.
//!
//! Machines exist only as entries in memory. Useful for tests and demos; an optional
//! start delay makes lifecycle races observable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use devspace_core::status::Machine;
use devspace_core::{Environment, InfrastructureError, MachineStatus, RuntimeIdentity, ValidationError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Recipe types handled by the no-op infrastructure.
pub const RECIPE_TYPES: &[&str] = &["noop"];

type Running = Arc<Mutex<BTreeMap<String, RuntimeIdentity>>>;

fn running(map: &Running) -> MutexGuard<'_, BTreeMap<String, RuntimeIdentity>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// No-op infrastructure.
#[derive(Debug, Clone, Default)]
pub struct NoOpInfrastructure {
    start_delay: Duration,
    running: Running,
    stop_faults: Arc<AtomicUsize>,
}

impl NoOpInfrastructure {
    /// Infrastructure whose starts take `start_delay`.
    pub fn new(start_delay: Duration) -> Self {
        Self {
            start_delay,
            running: Arc::default(),
            stop_faults: Arc::default(),
        }
    }

    /// Fail the next `times` stops with a non-transient backend error.
    pub fn fail_next_stops(&self, times: usize) {
        self.stop_faults.store(times, Ordering::SeqCst);
    }

    /// Drop a runtime behind the orchestrator's back.
    pub fn kill(&self, workspace_id: &str) -> bool {
        running(&self.running).remove(workspace_id).is_some()
    }

    pub(crate) fn estimate(&self, environment: &Environment) -> Result<Environment, ValidationError> {
        environment.validate()?;
        Ok(environment.clone())
    }

    pub(crate) fn prepare(&self, identity: &RuntimeIdentity, environment: &Environment) -> NoOpRuntimeContext {
        NoOpRuntimeContext {
            identity: identity.clone(),
            environment: Some(environment.clone()),
            machines: Vec::new(),
            start_delay: self.start_delay,
            running: self.running.clone(),
            stop_faults: self.stop_faults.clone(),
        }
    }

    pub(crate) fn context_for(&self, identity: &RuntimeIdentity) -> NoOpRuntimeContext {
        NoOpRuntimeContext {
            identity: identity.clone(),
            environment: None,
            machines: Vec::new(),
            start_delay: self.start_delay,
            running: self.running.clone(),
            stop_faults: self.stop_faults.clone(),
        }
    }

    pub(crate) fn identities(&self) -> Vec<RuntimeIdentity> {
        running(&self.running).values().cloned().collect()
    }
}

/// Runtime of the no-op infrastructure.
pub struct NoOpRuntimeContext {
    identity: RuntimeIdentity,
    environment: Option<Environment>,
    machines: Vec<Machine>,
    start_delay: Duration,
    running: Running,
    stop_faults: Arc<AtomicUsize>,
}

impl NoOpRuntimeContext {
    pub(crate) fn identity(&self) -> &RuntimeIdentity {
        &self.identity
    }

    pub(crate) fn provision(&mut self) -> Result<(), InfrastructureError> {
        Ok(())
    }

    pub(crate) async fn start(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Machine>, InfrastructureError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(InfrastructureError::Interrupted(
                    self.identity.workspace_id.clone(),
                ));
            }
            _ = tokio::time::sleep(self.start_delay) => {}
        }

        let machines: Vec<Machine> = self
            .environment
            .iter()
            .flat_map(|env| env.machines.iter())
            .map(|(name, config)| Machine {
                name: name.clone(),
                backend_id: format!("noop-{}-{}", self.identity.workspace_id, name),
                status: MachineStatus::Running,
                servers: config.servers.clone(),
            })
            .collect();
        running(&self.running).insert(self.identity.workspace_id.clone(), self.identity.clone());
        debug!(workspace_id = %self.identity.workspace_id, machines = machines.len(), "No-op runtime started");
        self.machines = machines.clone();
        Ok(machines)
    }

    pub(crate) fn stop(&mut self) -> Result<(), InfrastructureError> {
        let injected = self
            .stop_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(InfrastructureError::backend(
                "stop",
                "injected failure",
                false,
            ));
        }
        running(&self.running).remove(&self.identity.workspace_id);
        self.machines.clear();
        Ok(())
    }

    pub(crate) fn machines(&self) -> Vec<Machine> {
        self.machines.clone()
    }

    pub(crate) fn is_alive(&self) -> bool {
        running(&self.running).contains_key(&self.identity.workspace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devspace_core::{MachineConfig, Recipe};

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity::new("w1", "default", "alice", "alice")
    }

    fn environment() -> Environment {
        Environment::new(Recipe::of_type("noop")).machine("dev", MachineConfig::default())
    }

    #[tokio::test]
    async fn test_start_stop() {
        let infra = NoOpInfrastructure::default();
        let mut ctx = infra.prepare(&identity(), &environment());
        let machines = ctx.start(&CancellationToken::new()).await.unwrap();
        assert_eq!(machines.len(), 1);
        assert!(ctx.is_alive());
        assert_eq!(infra.identities(), vec![identity()]);

        infra.context_for(&identity()).stop().unwrap();
        assert!(!ctx.is_alive());
    }

    #[tokio::test]
    async fn test_delayed_start_observes_cancel() {
        let infra = NoOpInfrastructure::new(Duration::from_secs(30));
        let mut ctx = infra.prepare(&identity(), &environment());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let begin = std::time::Instant::now();
        let err = ctx.start(&cancel).await.unwrap_err();
        assert!(matches!(err, InfrastructureError::Interrupted(_)));
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert!(infra.identities().is_empty());
    }

    #[tokio::test]
    async fn test_injected_stop_failure() {
        let infra = NoOpInfrastructure::default();
        let mut ctx = infra.prepare(&identity(), &environment());
        ctx.start(&CancellationToken::new()).await.unwrap();

        infra.fail_next_stops(1);
        assert!(!ctx.stop().unwrap_err().is_transient());
        assert!(ctx.is_alive());
        ctx.stop().unwrap();
        assert!(!ctx.is_alive());
    }
}
