// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Devspace Master - workspace runtime orchestration node
//!
//! Runs one master node:
//! - Infrastructures (local engine, Kubernetes, OpenShift, no-op) selected by configuration
//! - Cluster membership and the distributed workspace lock (single node when unconfigured)
//! - Idle checker stopping idle and overlong workspaces
//! - Runtime monitor cleaning up runtimes that died on their own

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use devspace_core::permissions::{Acl, PermissionDomain, WORKSPACE_DOMAIN};
use devspace_core::repository::InMemoryWorkspaceRepository;
use devspace_core::{PermissionsManager, WorkspaceConfig};
use tracing::{info, warn};

use devspace_master::config::Config;
use devspace_master::runtime::MasterRuntimeBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devspace_master=info,devspace_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        node_id = %config.node_id,
        infrastructures = ?config.infrastructures,
        clustered = config.cluster.is_some(),
        persistent = config.database_url.is_some(),
        "Starting Devspace Master"
    );

    let builder = MasterRuntimeBuilder::from_config(&config).await?;
    let repository = InMemoryWorkspaceRepository::new();
    let permissions = PermissionsManager::new(builder.event_bus().clone());
    if let Some(path) = &config.workspaces_file {
        let seeded = seed_workspaces(path, &repository, &permissions).await?;
        info!(workspaces = seeded, file = %path.display(), "Workspaces loaded");
    }

    let runtime = builder
        .repository(Arc::new(repository))
        .permissions(Arc::new(permissions))
        .build()?
        .start()
        .await?;

    info!(node_id = %runtime.cluster().node_id(), "Master ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Devspace Master shut down");

    Ok(())
}

/// Load workspaces from a JSON list and grant each owner every workspace action.
async fn seed_workspaces(
    path: &Path,
    repository: &InMemoryWorkspaceRepository,
    permissions: &PermissionsManager,
) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let workspaces: Vec<WorkspaceConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let owner_actions = PermissionDomain::workspace().allowed_actions;
    let owner_actions: Vec<&str> = owner_actions.iter().map(String::as_str).collect();
    let count = workspaces.len();
    for workspace in workspaces {
        permissions
            .store(
                Acl::user(
                    WORKSPACE_DOMAIN,
                    Some(workspace.id.as_str()),
                    workspace.owner_id.clone(),
                    &owner_actions,
                ),
                None,
            )
            .await?;
        repository.put(workspace).await;
    }
    Ok(count)
}
