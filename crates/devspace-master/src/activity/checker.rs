// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker stopping idle and overlong workspaces.
//!
//! Each pass asks the activity store for RUNNING workspaces whose idle timeout elapsed
//! (and, when a run timeout is configured, those running for too long) and stops them
//! through [`WorkspaceRuntimes::system_stop`], so the stop takes the same workspace lock
//! as a user stop. Every `reconcile_every` passes the activity records are realigned
//! with the runtime status cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use devspace_core::{Result, RuntimeError, WorkspaceStatus};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::WorkspaceActivityManager;
use crate::runtimes::{StopOptions, WorkspaceRuntimes};

/// Initiator recorded on stops issued by the checker.
pub const ACTIVITY_CHECKER: &str = "activity-checker";
/// Reason recorded on idle stops.
pub const IDLE_TIMEOUT_REASON: &str = "Workspace idle timeout exceeded";
/// Reason recorded on run-timeout stops.
pub const RUN_TIMEOUT_REASON: &str = "Workspace run timeout exceeded";

/// Configuration for the idle checker.
#[derive(Debug, Clone)]
pub struct IdleCheckerConfig {
    /// How often to look for expired workspaces.
    pub check_interval: Duration,
    /// Maximum running time regardless of activity; zero disables it.
    pub run_timeout: Duration,
    /// Reconcile activity records every this many passes; zero disables it.
    pub reconcile_every: u32,
}

impl Default for IdleCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            run_timeout: Duration::ZERO,
            reconcile_every: 10,
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    /// Workspaces stopped by this pass.
    pub stopped: Vec<String>,
    /// Workspaces left alone: already stopped elsewhere or locked by another transition.
    pub skipped: Vec<String>,
    /// Workspaces whose stop failed; retried on the next pass.
    pub failed: Vec<String>,
}

/// Background worker stopping expired workspaces.
pub struct IdleChecker {
    config: IdleCheckerConfig,
    activity: WorkspaceActivityManager,
    runtimes: WorkspaceRuntimes,
    shutdown: Arc<Notify>,
}

impl IdleChecker {
    /// Create a checker stopping workspaces through `runtimes`.
    pub fn new(config: IdleCheckerConfig, runtimes: WorkspaceRuntimes) -> Self {
        Self {
            config,
            activity: runtimes.activity().clone(),
            runtimes,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the checker loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            run_timeout_secs = self.config.run_timeout.as_secs(),
            reconcile_every = self.config.reconcile_every,
            "Idle checker started"
        );

        let mut passes: u32 = 0;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Idle checker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.check_interval) => {
                    passes = passes.wrapping_add(1);
                    if self.config.reconcile_every > 0
                        && passes % self.config.reconcile_every == 0
                        && let Err(e) = self.reconcile().await
                    {
                        error!(error = %e, "Failed to reconcile activity records");
                    }
                    if let Err(e) = self.check_once().await {
                        error!(error = %e, "Failed to check workspace activity");
                    }
                }
            }
        }

        info!("Idle checker stopped");
    }

    /// Run one pass.
    pub async fn check_once(&self) -> Result<CheckSummary> {
        let idle = self.activity.expired_idle().await?;
        let overlong = self.activity.expired_run(self.config.run_timeout).await?;
        if idle.is_empty() && overlong.is_empty() {
            debug!("No expired workspaces found");
            return Ok(CheckSummary::default());
        }

        let mut summary = CheckSummary::default();
        let mut seen = HashSet::new();
        let expired = idle
            .into_iter()
            .map(|id| (id, IDLE_TIMEOUT_REASON))
            .chain(overlong.into_iter().map(|id| (id, RUN_TIMEOUT_REASON)));
        for (workspace_id, reason) in expired {
            if !seen.insert(workspace_id.clone()) {
                continue;
            }
            self.stop_expired(workspace_id, reason, &mut summary).await?;
        }

        if !summary.stopped.is_empty() || !summary.failed.is_empty() {
            info!(
                stopped = summary.stopped.len(),
                skipped = summary.skipped.len(),
                failed = summary.failed.len(),
                "Idle check finished"
            );
        }
        Ok(summary)
    }

    async fn stop_expired(
        &self,
        workspace_id: String,
        reason: &'static str,
        summary: &mut CheckSummary,
    ) -> Result<()> {
        let options = StopOptions::new(ACTIVITY_CHECKER, reason);
        match self.runtimes.system_stop(&workspace_id, options).await {
            Ok(()) => {
                info!(workspace_id = %workspace_id, reason, "Stopped expired workspace");
                summary.stopped.push(workspace_id);
            }
            Err(RuntimeError::NotFound(message)) => {
                if self.runtimes.get_runtime(&workspace_id).await?.is_some() {
                    error!(workspace_id = %workspace_id, message = %message, "Failed to stop expired workspace");
                    summary.failed.push(workspace_id);
                } else {
                    debug!(workspace_id = %workspace_id, "Expired workspace already stopped");
                    self.activity.on_stopped(&workspace_id).await?;
                    summary.skipped.push(workspace_id);
                }
            }
            Err(RuntimeError::Conflict(message)) => {
                warn!(workspace_id = %workspace_id, message = %message, "Expired workspace is busy, skipping");
                summary.skipped.push(workspace_id);
            }
            Err(e) => {
                error!(workspace_id = %workspace_id, error = %e, "Failed to stop expired workspace");
                summary.failed.push(workspace_id);
            }
        }
        Ok(())
    }

    /// Realign activity records with the runtime status cache.
    ///
    /// Records of workspaces without a runtime are dropped, RUNNING workspaces without a
    /// record get one, and records lagging behind the cached status are updated. Returns
    /// the number of records changed.
    pub async fn reconcile(&self) -> Result<usize> {
        let runtimes: HashMap<String, WorkspaceStatus> = self
            .runtimes
            .list_runtimes()
            .await?
            .into_iter()
            .map(|r| (r.identity.workspace_id, r.status))
            .collect();
        let records = self.activity.store().list_all().await?;
        let now = self.activity.clock().now();

        let mut changed = 0;
        let mut tracked = HashSet::new();
        for record in records {
            tracked.insert(record.workspace_id.clone());
            match runtimes.get(&record.workspace_id) {
                None => {
                    debug!(workspace_id = %record.workspace_id, "Dropping activity of stopped workspace");
                    self.activity.on_stopped(&record.workspace_id).await?;
                    changed += 1;
                }
                Some(&status)
                    if status != record.status && status != WorkspaceStatus::Error =>
                {
                    debug!(
                        workspace_id = %record.workspace_id,
                        from = %record.status,
                        to = %status,
                        "Realigning activity status"
                    );
                    self.activity
                        .store()
                        .set_status(&record.workspace_id, status, now)
                        .await?;
                    changed += 1;
                }
                Some(_) => {}
            }
        }

        for (workspace_id, status) in &runtimes {
            if *status == WorkspaceStatus::Running && !tracked.contains(workspace_id) {
                debug!(workspace_id = %workspace_id, "Tracking activity of untracked workspace");
                let idle_timeout = self.runtimes.idle_timeout(workspace_id).await;
                self.activity.on_running(workspace_id, idle_timeout).await?;
                changed += 1;
            }
        }

        if changed > 0 {
            info!(changed, "Activity records reconciled");
        }
        Ok(changed)
    }
}
