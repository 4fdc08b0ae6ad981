// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity records and the shared runtime status cache.
//!
//! Both stores are shared by every node of a cluster when backed by SQLite, and
//! node-local when kept in memory.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryStore;
pub use self::sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::RuntimeIdentity;
use crate::status::WorkspaceStatus;

/// Store failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database call failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Database directory could not be created.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded.
    #[error("Corrupt record for workspace '{workspace_id}': {details}")]
    Corrupt {
        /// Workspace the row belongs to.
        workspace_id: String,
        /// What was wrong.
        details: String,
    },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Activity record of one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceActivity {
    /// Workspace id.
    pub workspace_id: String,
    /// Last known status.
    pub status: WorkspaceStatus,
    /// When the record was created.
    pub created: DateTime<Utc>,
    /// Last reported user activity. Never decreases.
    pub last_activity: DateTime<Utc>,
    /// When the workspace last entered RUNNING.
    pub last_running: Option<DateTime<Utc>>,
    /// Idle timeout in seconds; 0 disables idle stop.
    pub idle_timeout_secs: u64,
}

impl WorkspaceActivity {
    /// New record with `last_activity = now`.
    pub fn new(
        workspace_id: impl Into<String>,
        status: WorkspaceStatus,
        now: DateTime<Utc>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            status,
            created: now,
            last_activity: now,
            last_running: (status == WorkspaceStatus::Running).then_some(now),
            idle_timeout_secs: idle_timeout.as_secs(),
        }
    }

    /// Whether the idle timeout elapsed strictly before `now`.
    pub fn is_idle_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkspaceStatus::Running
            && self.idle_timeout_secs > 0
            && self.last_activity + secs(self.idle_timeout_secs) < now
    }

    /// Whether the workspace has been running longer than `run_timeout`.
    pub fn is_run_expired(&self, now: DateTime<Utc>, run_timeout: Duration) -> bool {
        self.status == WorkspaceStatus::Running
            && !run_timeout.is_zero()
            && self
                .last_running
                .is_some_and(|since| since + secs(run_timeout.as_secs()) < now)
    }
}

fn secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Persistence of activity records.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Insert a record, replacing an existing one.
    async fn save(&self, activity: WorkspaceActivity) -> StoreResult<()>;

    /// Record by workspace id.
    async fn get(&self, workspace_id: &str) -> StoreResult<Option<WorkspaceActivity>>;

    /// Move `last_activity` forward to `at`. Older timestamps are ignored.
    ///
    /// Returns false when no record exists.
    async fn update_last_activity(
        &self,
        workspace_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Set the status. Moving from STARTING to RUNNING stamps `last_running` and
    /// `last_activity`; any other transition keeps both.
    ///
    /// Returns false when no record exists.
    async fn set_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Delete a record. Returns whether one existed.
    async fn remove(&self, workspace_id: &str) -> StoreResult<bool>;

    /// Ids of RUNNING workspaces whose idle timeout elapsed before `now`.
    async fn find_expired_idle(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>>;

    /// Ids of RUNNING workspaces running for longer than `run_timeout` at `now`.
    async fn find_expired_run(
        &self,
        now: DateTime<Utc>,
        run_timeout: Duration,
    ) -> StoreResult<Vec<String>>;

    /// All records.
    async fn list_all(&self) -> StoreResult<Vec<WorkspaceActivity>>;
}

/// Last published lifecycle snapshot of a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatusRecord {
    /// Identity of the runtime.
    pub identity: RuntimeIdentity,
    /// Current status.
    pub status: WorkspaceStatus,
    /// Failure description when status is ERROR.
    pub error: Option<String>,
    /// Node that last drove a transition.
    pub owner_node: Option<String>,
    /// Time of the last update.
    pub updated_at: DateTime<Utc>,
}

/// Cluster-shared runtime status snapshots, read by unlocked status queries.
///
/// Written only by the node holding the workspace lock.
#[async_trait]
pub trait RuntimeStatusCache: Send + Sync {
    /// Snapshot by workspace id.
    async fn get_status(&self, workspace_id: &str) -> StoreResult<Option<RuntimeStatusRecord>>;

    /// Insert or replace a snapshot.
    async fn put_status(&self, record: RuntimeStatusRecord) -> StoreResult<()>;

    /// Delete a snapshot, returning it.
    async fn remove_status(&self, workspace_id: &str) -> StoreResult<Option<RuntimeStatusRecord>>;

    /// Every snapshot.
    async fn list_statuses(&self) -> StoreResult<Vec<RuntimeStatusRecord>>;
}
