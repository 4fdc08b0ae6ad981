// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed stores.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{
    ActivityStore, RuntimeStatusCache, RuntimeStatusRecord, StoreError, StoreResult,
    WorkspaceActivity,
};
use crate::identity::RuntimeIdentity;
use crate::status::WorkspaceStatus;

/// SQLite migrator with the store schema embedded.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite implementation of both stores.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ActivityRow {
    workspace_id: String,
    status: String,
    created_ms: i64,
    last_activity_ms: i64,
    last_running_ms: Option<i64>,
    idle_timeout_secs: i64,
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    workspace_id: String,
    env_name: String,
    owner_id: String,
    infrastructure_namespace: String,
    status: String,
    error: Option<String>,
    owner_node: Option<String>,
    updated_ms: i64,
}

fn corrupt(workspace_id: &str, details: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        workspace_id: workspace_id.to_string(),
        details: details.into(),
    }
}

fn from_millis(workspace_id: &str, ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| corrupt(workspace_id, format!("timestamp {} out of range", ms)))
}

fn parse_status(workspace_id: &str, status: &str) -> StoreResult<WorkspaceStatus> {
    status.parse().map_err(|e: String| corrupt(workspace_id, e))
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

impl TryFrom<ActivityRow> for WorkspaceActivity {
    type Error = StoreError;

    fn try_from(row: ActivityRow) -> StoreResult<Self> {
        let id = row.workspace_id.as_str();
        Ok(Self {
            status: parse_status(id, &row.status)?,
            created: from_millis(id, row.created_ms)?,
            last_activity: from_millis(id, row.last_activity_ms)?,
            last_running: row
                .last_running_ms
                .map(|ms| from_millis(id, ms))
                .transpose()?,
            idle_timeout_secs: u64::try_from(row.idle_timeout_secs).unwrap_or(0),
            workspace_id: row.workspace_id,
        })
    }
}

impl TryFrom<StatusRow> for RuntimeStatusRecord {
    type Error = StoreError;

    fn try_from(row: StatusRow) -> StoreResult<Self> {
        let status = parse_status(&row.workspace_id, &row.status)?;
        let updated_at = from_millis(&row.workspace_id, row.updated_ms)?;
        Ok(Self {
            identity: RuntimeIdentity {
                workspace_id: row.workspace_id,
                env_name: row.env_name,
                owner_id: row.owner_id,
                infrastructure_namespace: row.infrastructure_namespace,
            },
            status,
            error: row.error,
            owner_node: row.owner_node,
            updated_at,
        })
    }
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL and run migrations.
    ///
    /// In-memory URLs get a single connection, since every connection would otherwise
    /// see its own empty database.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const ACTIVITY_COLUMNS: &str = "workspace_id, status, created_ms, last_activity_ms, last_running_ms, idle_timeout_secs";

#[async_trait]
impl ActivityStore for SqliteStore {
    async fn save(&self, activity: WorkspaceActivity) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workspace_activity
                (workspace_id, status, created_ms, last_activity_ms, last_running_ms, idle_timeout_secs)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (workspace_id) DO UPDATE SET
                status = excluded.status,
                created_ms = excluded.created_ms,
                last_activity_ms = excluded.last_activity_ms,
                last_running_ms = excluded.last_running_ms,
                idle_timeout_secs = excluded.idle_timeout_secs
            "#,
        )
        .bind(&activity.workspace_id)
        .bind(activity.status.as_str())
        .bind(activity.created.timestamp_millis())
        .bind(activity.last_activity.timestamp_millis())
        .bind(activity.last_running.map(|t| t.timestamp_millis()))
        .bind(secs_i64(activity.idle_timeout_secs))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, workspace_id: &str) -> StoreResult<Option<WorkspaceActivity>> {
        let row = sqlx::query_as::<_, ActivityRow>(&format!(
            "SELECT {} FROM workspace_activity WHERE workspace_id = ?",
            ACTIVITY_COLUMNS
        ))
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkspaceActivity::try_from).transpose()
    }

    async fn update_last_activity(
        &self,
        workspace_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workspace_activity
            SET last_activity_ms = MAX(last_activity_ms, ?)
            WHERE workspace_id = ?
            "#,
        )
        .bind(at.timestamp_millis())
        .bind(workspace_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let at = at.timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE workspace_activity
            SET last_running_ms = CASE
                    WHEN ?1 = 'RUNNING' AND status = 'STARTING' THEN ?2
                    ELSE last_running_ms
                END,
                last_activity_ms = CASE
                    WHEN ?1 = 'RUNNING' AND status = 'STARTING' THEN MAX(last_activity_ms, ?2)
                    ELSE last_activity_ms
                END,
                status = ?1
            WHERE workspace_id = ?3
            "#,
        )
        .bind(status.as_str())
        .bind(at)
        .bind(workspace_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, workspace_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM workspace_activity WHERE workspace_id = ?")
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_expired_idle(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT workspace_id FROM workspace_activity
            WHERE status = 'RUNNING'
              AND idle_timeout_secs > 0
              AND last_activity_ms + idle_timeout_secs * 1000 < ?
            ORDER BY workspace_id
            "#,
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn find_expired_run(
        &self,
        now: DateTime<Utc>,
        run_timeout: Duration,
    ) -> StoreResult<Vec<String>> {
        if run_timeout.is_zero() {
            return Ok(Vec::new());
        }
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT workspace_id FROM workspace_activity
            WHERE status = 'RUNNING'
              AND last_running_ms IS NOT NULL
              AND last_running_ms + ? < ?
            ORDER BY workspace_id
            "#,
        )
        .bind(secs_i64(run_timeout.as_secs()).saturating_mul(1000))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_all(&self) -> StoreResult<Vec<WorkspaceActivity>> {
        let rows = sqlx::query_as::<_, ActivityRow>(&format!(
            "SELECT {} FROM workspace_activity ORDER BY workspace_id",
            ACTIVITY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkspaceActivity::try_from).collect()
    }
}

const STATUS_COLUMNS: &str = "workspace_id, env_name, owner_id, infrastructure_namespace, status, error, owner_node, updated_ms";

#[async_trait]
impl RuntimeStatusCache for SqliteStore {
    async fn get_status(&self, workspace_id: &str) -> StoreResult<Option<RuntimeStatusRecord>> {
        let row = sqlx::query_as::<_, StatusRow>(&format!(
            "SELECT {} FROM runtime_status WHERE workspace_id = ?",
            STATUS_COLUMNS
        ))
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RuntimeStatusRecord::try_from).transpose()
    }

    async fn put_status(&self, record: RuntimeStatusRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runtime_status
                (workspace_id, env_name, owner_id, infrastructure_namespace,
                 status, error, owner_node, updated_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (workspace_id) DO UPDATE SET
                env_name = excluded.env_name,
                owner_id = excluded.owner_id,
                infrastructure_namespace = excluded.infrastructure_namespace,
                status = excluded.status,
                error = excluded.error,
                owner_node = excluded.owner_node,
                updated_ms = excluded.updated_ms
            "#,
        )
        .bind(&record.identity.workspace_id)
        .bind(&record.identity.env_name)
        .bind(&record.identity.owner_id)
        .bind(&record.identity.infrastructure_namespace)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(&record.owner_node)
        .bind(record.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_status(&self, workspace_id: &str) -> StoreResult<Option<RuntimeStatusRecord>> {
        let row = sqlx::query_as::<_, StatusRow>(&format!(
            "DELETE FROM runtime_status WHERE workspace_id = ? RETURNING {}",
            STATUS_COLUMNS
        ))
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RuntimeStatusRecord::try_from).transpose()
    }

    async fn list_statuses(&self) -> StoreResult<Vec<RuntimeStatusRecord>> {
        let rows = sqlx::query_as::<_, StatusRow>(&format!(
            "SELECT {} FROM runtime_status ORDER BY workspace_id",
            STATUS_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RuntimeStatusRecord::try_from).collect()
    }
}
