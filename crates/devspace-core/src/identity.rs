// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable key of one running workspace instance.
///
/// Created when a start is requested, dropped once the runtime is fully torn down.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuntimeIdentity {
    /// Workspace id.
    pub workspace_id: String,
    /// Name of the environment being run.
    pub env_name: String,
    /// Owner of the workspace.
    pub owner_id: String,
    /// Backend namespace (Kubernetes namespace, OpenShift project, engine network prefix).
    pub infrastructure_namespace: String,
}

impl RuntimeIdentity {
    /// Create a new identity.
    pub fn new(
        workspace_id: impl Into<String>,
        env_name: impl Into<String>,
        owner_id: impl Into<String>,
        infrastructure_namespace: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            env_name: env_name.into(),
            owner_id: owner_id.into(),
            infrastructure_namespace: infrastructure_namespace.into(),
        }
    }
}

impl fmt::Display for RuntimeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.workspace_id, self.env_name, self.owner_id, self.infrastructure_namespace
        )
    }
}
