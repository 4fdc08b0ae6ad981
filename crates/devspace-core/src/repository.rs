// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace configuration lookup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::environment::WorkspaceConfig;

/// Narrow view of workspace persistence used by the lifecycle service.
#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    /// Workspace configuration by id.
    async fn get(&self, workspace_id: &str) -> Option<WorkspaceConfig>;

    /// Every stored workspace id.
    async fn list_ids(&self) -> Vec<String>;
}

/// Repository keeping workspaces in memory.
#[derive(Clone, Default)]
pub struct InMemoryWorkspaceRepository {
    workspaces: Arc<RwLock<HashMap<String, WorkspaceConfig>>>,
}

impl InMemoryWorkspaceRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workspace.
    pub async fn put(&self, workspace: WorkspaceConfig) {
        self.workspaces
            .write()
            .await
            .insert(workspace.id.clone(), workspace);
    }

    /// Remove a workspace.
    pub async fn remove(&self, workspace_id: &str) -> Option<WorkspaceConfig> {
        self.workspaces.write().await.remove(workspace_id)
    }
}

#[async_trait]
impl WorkspaceRepository for InMemoryWorkspaceRepository {
    async fn get(&self, workspace_id: &str) -> Option<WorkspaceConfig> {
        self.workspaces.read().await.get(workspace_id).cloned()
    }

    async fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workspaces.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
