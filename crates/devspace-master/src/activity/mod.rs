// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace activity tracking.
//!
//! [`WorkspaceActivityManager`] keeps one [`WorkspaceActivity`] record per started
//! workspace in an [`ActivityStore`]. User interactions move `last_activity` forward, but
//! at most once per `min_report_interval` per workspace on this node, so a burst of
//! requests costs one store write. The [`IdleChecker`] reads the records back.

mod checker;

pub use self::checker::{
    ACTIVITY_CHECKER, CheckSummary, IDLE_TIMEOUT_REASON, IdleChecker, IdleCheckerConfig,
    RUN_TIMEOUT_REASON,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use devspace_core::Clock;
use devspace_core::WorkspaceStatus;
use devspace_core::store::{ActivityStore, StoreResult, WorkspaceActivity};
use tracing::debug;

/// Activity tracking settings.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Minimum time between two `last_activity` writes of one workspace.
    pub min_report_interval: Duration,
    /// Idle timeout of workspaces that set none; zero disables idle stop.
    pub default_idle_timeout: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            min_report_interval: Duration::from_secs(60),
            default_idle_timeout: Duration::from_secs(1800),
        }
    }
}

/// Kind of observed user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    /// A workspace API request.
    ApiCall,
    /// A frame on an open websocket.
    WebsocketFrame,
    /// A keep-alive ping. Never counts as activity.
    KeepAlive,
}

/// Records workspace activity.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct WorkspaceActivityManager {
    store: Arc<dyn ActivityStore>,
    clock: Arc<dyn Clock>,
    config: ActivityConfig,
    last_reported: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl WorkspaceActivityManager {
    /// Manager writing to `store`, reading time from `clock`.
    pub fn new(store: Arc<dyn ActivityStore>, clock: Arc<dyn Clock>, config: ActivityConfig) -> Self {
        Self {
            store,
            clock,
            config,
            last_reported: Arc::default(),
        }
    }

    fn last_reported(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.last_reported.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn ActivityStore> {
        &self.store
    }

    /// Time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Idle timeout for a workspace override, falling back to the default.
    pub fn idle_timeout_for(&self, override_secs: Option<u64>) -> Duration {
        override_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_idle_timeout)
    }

    /// Report a user interaction.
    ///
    /// Returns whether `last_activity` was written. Signals arriving within
    /// `min_report_interval` of the previous write are dropped, as are keep-alives and
    /// signals for workspaces without a record.
    pub async fn on_activity(&self, workspace_id: &str, signal: ActivitySignal) -> StoreResult<bool> {
        if signal == ActivitySignal::KeepAlive {
            return Ok(false);
        }
        let now = self.clock.now();
        let interval = chrono::Duration::from_std(self.config.min_report_interval)
            .unwrap_or(chrono::Duration::MAX);
        {
            let mut reported = self.last_reported();
            if let Some(previous) = reported.get(workspace_id)
                && now - *previous < interval
            {
                return Ok(false);
            }
            reported.insert(workspace_id.to_string(), now);
        }
        let updated = self.store.update_last_activity(workspace_id, now).await?;
        if updated {
            debug!(workspace_id, ?signal, at = %now, "Workspace activity recorded");
        } else {
            self.last_reported().remove(workspace_id);
        }
        Ok(updated)
    }

    /// A start began. Creates the record with `last_activity = now`.
    pub async fn on_starting(&self, workspace_id: &str, idle_timeout: Duration) -> StoreResult<()> {
        self.last_reported().remove(workspace_id);
        self.store
            .save(WorkspaceActivity::new(
                workspace_id,
                WorkspaceStatus::Starting,
                self.clock.now(),
                idle_timeout,
            ))
            .await
    }

    /// The workspace is running. Creates a record if none exists.
    pub async fn on_running(&self, workspace_id: &str, idle_timeout: Duration) -> StoreResult<()> {
        let now = self.clock.now();
        if !self
            .store
            .set_status(workspace_id, WorkspaceStatus::Running, now)
            .await?
        {
            self.store
                .save(WorkspaceActivity::new(
                    workspace_id,
                    WorkspaceStatus::Running,
                    now,
                    idle_timeout,
                ))
                .await?;
        }
        Ok(())
    }

    /// A stop began.
    pub async fn on_stopping(&self, workspace_id: &str) -> StoreResult<()> {
        self.store
            .set_status(workspace_id, WorkspaceStatus::Stopping, self.clock.now())
            .await
            .map(|_| ())
    }

    /// The workspace went back to running after a failed stop.
    pub async fn on_stop_failed(&self, workspace_id: &str) -> StoreResult<()> {
        self.store
            .set_status(workspace_id, WorkspaceStatus::Running, self.clock.now())
            .await
            .map(|_| ())
    }

    /// The runtime is gone. Removes the record.
    pub async fn on_stopped(&self, workspace_id: &str) -> StoreResult<()> {
        self.last_reported().remove(workspace_id);
        self.store.remove(workspace_id).await.map(|_| ())
    }

    /// Ids of running workspaces whose idle timeout elapsed.
    pub async fn expired_idle(&self) -> StoreResult<Vec<String>> {
        self.store.find_expired_idle(self.clock.now()).await
    }

    /// Ids of workspaces running longer than `run_timeout`.
    pub async fn expired_run(&self, run_timeout: Duration) -> StoreResult<Vec<String>> {
        if run_timeout.is_zero() {
            return Ok(Vec::new());
        }
        self.store
            .find_expired_run(self.clock.now(), run_timeout)
            .await
    }
}
