// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ordered provisioner pipelines.
//!
//! A provisioner mutates a backend environment `E` in place. Two shapes exist:
//!
//! - [`ConfigurationProvisioner`] sees the original [`Environment`] and the
//!   [`RuntimeIdentity`] (labels, env vars, servers).
//! - [`ContainerSettingsProvisioner`] sees only the backend environment (memory defaults,
//!   cgroup parent, PID limits).
//!
//! Every provisioner must be idempotent. A provisioner may declare the provisioners that
//! must run before it; [`ProvisionerPipeline::new`] rejects an order that violates a
//! declaration. The pipeline runs against a working copy and only commits it when every
//! step succeeded, so a failed pipeline leaves the target untouched.

use std::collections::HashSet;

use devspace_core::{Environment, InfrastructureError, RuntimeIdentity};
use tracing::debug;

/// Provisioner that reads the workspace configuration.
pub trait ConfigurationProvisioner<E>: Send + Sync {
    /// Unique name.
    fn name(&self) -> &'static str;

    /// Provisioners that must run earlier in the pipeline.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    /// Apply to `target`.
    fn provision(
        &self,
        environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut E,
    ) -> Result<(), InfrastructureError>;
}

/// Provisioner that only adjusts container system settings.
pub trait ContainerSettingsProvisioner<E>: Send + Sync {
    /// Unique name.
    fn name(&self) -> &'static str;

    /// Provisioners that must run earlier in the pipeline.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    /// Apply to `target`.
    fn provision(&self, target: &mut E) -> Result<(), InfrastructureError>;
}

/// One pipeline step.
pub enum ProvisionerStep<E> {
    /// Needs the environment and identity.
    Configuration(Box<dyn ConfigurationProvisioner<E>>),
    /// Needs only the backend environment.
    ContainerSettings(Box<dyn ContainerSettingsProvisioner<E>>),
}

impl<E> ProvisionerStep<E> {
    /// Wrap a configuration provisioner.
    pub fn configuration(p: impl ConfigurationProvisioner<E> + 'static) -> Self {
        Self::Configuration(Box::new(p))
    }

    /// Wrap a container settings provisioner.
    pub fn settings(p: impl ContainerSettingsProvisioner<E> + 'static) -> Self {
        Self::ContainerSettings(Box::new(p))
    }

    /// Step name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Configuration(p) => p.name(),
            Self::ContainerSettings(p) => p.name(),
        }
    }

    fn requires(&self) -> &'static [&'static str] {
        match self {
            Self::Configuration(p) => p.requires(),
            Self::ContainerSettings(p) => p.requires(),
        }
    }

    fn apply(
        &self,
        environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut E,
    ) -> Result<(), InfrastructureError> {
        match self {
            Self::Configuration(p) => p.provision(environment, identity, target),
            Self::ContainerSettings(p) => p.provision(target),
        }
    }
}

/// Explicitly ordered list of provisioners.
pub struct ProvisionerPipeline<E> {
    steps: Vec<ProvisionerStep<E>>,
}

impl<E: Clone> std::fmt::Debug for ProvisionerPipeline<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerPipeline")
            .field("steps", &self.names())
            .finish()
    }
}

impl<E: Clone> ProvisionerPipeline<E> {
    /// Build a pipeline, checking names are unique and every requirement runs earlier.
    pub fn new(steps: Vec<ProvisionerStep<E>>) -> Result<Self, InfrastructureError> {
        let mut seen = HashSet::new();
        for step in &steps {
            for required in step.requires() {
                if !seen.contains(required) {
                    return Err(InfrastructureError::Internal(format!(
                        "Provisioner '{}' requires '{}' to run before it",
                        step.name(),
                        required
                    )));
                }
            }
            if !seen.insert(step.name()) {
                return Err(InfrastructureError::Internal(format!(
                    "Provisioner '{}' is registered twice",
                    step.name()
                )));
            }
        }
        Ok(Self { steps })
    }

    /// Step names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(ProvisionerStep::name).collect()
    }

    /// Run every step in order. `target` is only updated if all steps succeed.
    pub fn provision(
        &self,
        environment: &Environment,
        identity: &RuntimeIdentity,
        target: &mut E,
    ) -> Result<(), InfrastructureError> {
        let mut working = target.clone();
        for step in &self.steps {
            step.apply(environment, identity, &mut working).map_err(|e| {
                debug!(
                    workspace_id = %identity.workspace_id,
                    provisioner = step.name(),
                    error = %e,
                    "Provisioner failed"
                );
                e
            })?;
        }
        *target = working;
        Ok(())
    }
}
