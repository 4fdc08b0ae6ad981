// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment Model.
//!
//! A normalized, backend-neutral description of the machines of a workspace. Infrastructures
//! project it into their own backend environment and never mutate the model itself: once an
//! [`Environment`] has been handed to an infrastructure it is treated as immutable and every
//! provisioning run works on a fresh projection.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Recipe type of a plain image reference.
pub const RECIPE_DOCKER_IMAGE: &str = "dockerimage";

/// Source of an environment: what kind of recipe it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Recipe type (`dockerimage`, `compose`, `kubernetes`, `openshift`, `noop`).
    #[serde(rename = "type")]
    pub recipe_type: String,
    /// Inline recipe content, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// MIME type of `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Location the recipe was loaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Recipe {
    /// Recipe with only a type.
    pub fn of_type(recipe_type: impl Into<String>) -> Self {
        Self {
            recipe_type: recipe_type.into(),
            content: None,
            content_type: None,
            location: None,
        }
    }
}

impl Default for Recipe {
    fn default() -> Self {
        Self::of_type(RECIPE_DOCKER_IMAGE)
    }
}

/// A server declared by a machine, e.g. `8080/http`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the server listens on inside the machine.
    pub port: u16,
    /// Application protocol (`http`, `ws`, `tcp`, ...).
    pub protocol: String,
    /// Optional URL path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ServerConfig {
    /// Transport protocol used to expose the port.
    pub fn transport(&self) -> &'static str {
        if self.protocol.eq_ignore_ascii_case("udp") {
            "udp"
        } else {
            "tcp"
        }
    }

    /// `port/transport` notation used when exposing the port.
    pub fn expose(&self) -> String {
        format!("{}/{}", self.port, self.transport())
    }
}

impl FromStr for ServerConfig {
    type Err = ValidationError;

    /// Parses `port` or `port/protocol`; the protocol defaults to `tcp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = match s.split_once('/') {
            Some((port, protocol)) => (port, protocol),
            None => (s, "tcp"),
        };
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| ValidationError::new(format!("Invalid server port in '{}'", s)))?;
        if port == 0 {
            return Err(ValidationError::new(format!("Invalid server port in '{}'", s)));
        }
        let protocol = protocol.trim();
        if protocol.is_empty() {
            return Err(ValidationError::new(format!("Missing server protocol in '{}'", s)));
        }
        Ok(Self {
            port,
            protocol: protocol.to_ascii_lowercase(),
            path: None,
        })
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// A volume mounted into a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Mount path inside the machine.
    pub path: String,
}

/// One machine of an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Servers keyed by server name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Volumes keyed by volume name.
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeConfig>,
    /// Memory limit in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<i64>,
    /// Maximum number of processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
    /// Machines that must be running before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Free-form attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl MachineConfig {
    /// Machine running the given image.
    pub fn with_image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            ..Default::default()
        }
    }

    /// Add a server declared as `port/protocol`.
    pub fn server(mut self, name: impl Into<String>, spec: &str) -> Result<Self, ValidationError> {
        self.servers.insert(name.into(), spec.parse()?);
        Ok(self)
    }

    /// Add an environment variable.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a volume.
    pub fn volume(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.volumes.insert(name.into(), VolumeConfig { path: path.into() });
        self
    }

    /// Set the memory limit in bytes.
    pub fn memory(mut self, bytes: i64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Declare a start dependency.
    pub fn depends_on(mut self, machine: impl Into<String>) -> Self {
        self.depends_on.push(machine.into());
        self
    }
}

/// A non-fatal remark attached to an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Numeric warning code.
    pub code: i32,
    /// Human readable message.
    pub message: String,
}

/// Backend-neutral description of a workspace's machines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Recipe the environment was built from.
    #[serde(default)]
    pub recipe: Recipe,
    /// Machines keyed by name.
    pub machines: BTreeMap<String, MachineConfig>,
    /// Warnings collected while building or normalizing.
    #[serde(default)]
    pub warnings: Vec<Warning>,
}

impl Environment {
    /// Environment with the given recipe type and no machines.
    pub fn new(recipe: Recipe) -> Self {
        Self {
            recipe,
            machines: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Add a machine.
    pub fn machine(mut self, name: impl Into<String>, config: MachineConfig) -> Self {
        self.machines.insert(name.into(), config);
        self
    }

    /// Structural checks shared by all infrastructures.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.machines.is_empty() {
            return Err(ValidationError::new("Environment should contain at least 1 machine"));
        }
        for name in self.machines.keys() {
            if name.trim().is_empty() {
                return Err(ValidationError::new("Machine name must not be empty"));
            }
        }
        self.machine_order().map(|_| ())
    }

    /// Machine names in start order: every machine after the machines it depends on.
    ///
    /// Ties are broken by name so the order is stable.
    pub fn machine_order(&self) -> Result<Vec<String>, ValidationError> {
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (name, machine) in &self.machines {
            let unique: BTreeSet<&str> = machine.depends_on.iter().map(String::as_str).collect();
            for dep in &unique {
                if !self.machines.contains_key(*dep) {
                    return Err(ValidationError::new(format!(
                        "Machine '{}' depends on unknown machine '{}'",
                        name, dep
                    )));
                }
                if *dep == name.as_str() {
                    return Err(ValidationError::new(format!(
                        "Machine '{}' depends on itself",
                        name
                    )));
                }
                dependents.entry(*dep).or_default().push(name.as_str());
            }
            pending.insert(name.as_str(), unique.len());
        }

        let mut ready: VecDeque<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.machines.len());

        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            if let Some(next) = dependents.get(name) {
                let mut unlocked = Vec::new();
                for dependent in next {
                    if let Some(count) = pending.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            unlocked.push(*dependent);
                        }
                    }
                }
                unlocked.sort_unstable();
                ready.extend(unlocked);
            }
        }

        if order.len() != self.machines.len() {
            let stuck: Vec<&str> = pending
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(ValidationError::new(format!(
                "Circular machine dependency between: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

/// Stored workspace configuration, as returned by the workspace repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Workspace id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Namespace the workspace belongs to (usually the owner's name).
    pub namespace: String,
    /// Owner id.
    pub owner_id: String,
    /// Environment used when a start does not name one.
    pub default_env: String,
    /// Environments keyed by name.
    pub environments: BTreeMap<String, Environment>,
    /// Free-form attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Idle timeout override in seconds; `Some(0)` disables idle stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

impl WorkspaceConfig {
    /// Environment by name, falling back to the default environment.
    pub fn environment(&self, env_name: Option<&str>) -> Option<(&str, &Environment)> {
        let name = env_name.unwrap_or(&self.default_env);
        self.environments
            .get_key_value(name)
            .map(|(name, env)| (name.as_str(), env))
    }
}
