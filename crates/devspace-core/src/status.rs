// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace and machine statuses.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::environment::ServerConfig;

/// Lifecycle status of a workspace runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    /// Start requested, runtime being prepared and started.
    Starting,
    /// All machines running.
    Running,
    /// Stop in progress.
    Stopping,
    /// No runtime exists.
    Stopped,
    /// Last start or stop failed.
    Error,
}

impl WorkspaceStatus {
    /// Upper-case name as stored and logged.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        }
    }

    /// Whether a transition is in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "STOPPING" => Ok(Self::Stopping),
            "STOPPED" => Ok(Self::Stopped),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown workspace status '{}'", other)),
        }
    }
}

/// Status of a single machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    /// Container or pod being created.
    Starting,
    /// Container or pod running.
    Running,
    /// Container or pod stopped.
    Stopped,
    /// Creation or start failed.
    Failed,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        })
    }
}

/// Snapshot of a machine of a running workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Machine name.
    pub name: String,
    /// Backend object id (container id, pod name).
    pub backend_id: String,
    /// Current status.
    pub status: MachineStatus,
    /// Servers declared by the machine.
    pub servers: BTreeMap<String, ServerConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_forms_agree() {
        for status in [
            WorkspaceStatus::Starting,
            WorkspaceStatus::Running,
            WorkspaceStatus::Stopping,
            WorkspaceStatus::Stopped,
            WorkspaceStatus::Error,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<WorkspaceStatus>().unwrap(), status);
        }
        assert!("running".parse::<WorkspaceStatus>().is_err());
    }
}
