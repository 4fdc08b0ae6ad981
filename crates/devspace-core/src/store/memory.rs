// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    ActivityStore, RuntimeStatusCache, RuntimeStatusRecord, StoreResult, WorkspaceActivity,
};
use crate::status::WorkspaceStatus;

/// Node-local implementation of both stores.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    activity: Arc<RwLock<HashMap<String, WorkspaceActivity>>>,
    statuses: Arc<RwLock<HashMap<String, RuntimeStatusRecord>>>,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_ids(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

#[async_trait]
impl ActivityStore for InMemoryStore {
    async fn save(&self, activity: WorkspaceActivity) -> StoreResult<()> {
        self.activity
            .write()
            .await
            .insert(activity.workspace_id.clone(), activity);
        Ok(())
    }

    async fn get(&self, workspace_id: &str) -> StoreResult<Option<WorkspaceActivity>> {
        Ok(self.activity.read().await.get(workspace_id).cloned())
    }

    async fn update_last_activity(
        &self,
        workspace_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut activity = self.activity.write().await;
        let Some(record) = activity.get_mut(workspace_id) else {
            return Ok(false);
        };
        if at > record.last_activity {
            record.last_activity = at;
        }
        Ok(true)
    }

    async fn set_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut activity = self.activity.write().await;
        let Some(record) = activity.get_mut(workspace_id) else {
            return Ok(false);
        };
        if status == WorkspaceStatus::Running && record.status == WorkspaceStatus::Starting {
            record.last_running = Some(at);
            if at > record.last_activity {
                record.last_activity = at;
            }
        }
        record.status = status;
        Ok(true)
    }

    async fn remove(&self, workspace_id: &str) -> StoreResult<bool> {
        Ok(self.activity.write().await.remove(workspace_id).is_some())
    }

    async fn find_expired_idle(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let activity = self.activity.read().await;
        Ok(sorted_ids(
            activity
                .values()
                .filter(|a| a.is_idle_expired(now))
                .map(|a| a.workspace_id.clone())
                .collect(),
        ))
    }

    async fn find_expired_run(
        &self,
        now: DateTime<Utc>,
        run_timeout: Duration,
    ) -> StoreResult<Vec<String>> {
        let activity = self.activity.read().await;
        Ok(sorted_ids(
            activity
                .values()
                .filter(|a| a.is_run_expired(now, run_timeout))
                .map(|a| a.workspace_id.clone())
                .collect(),
        ))
    }

    async fn list_all(&self) -> StoreResult<Vec<WorkspaceActivity>> {
        let mut all: Vec<_> = self.activity.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.workspace_id.cmp(&b.workspace_id));
        Ok(all)
    }
}

#[async_trait]
impl RuntimeStatusCache for InMemoryStore {
    async fn get_status(&self, workspace_id: &str) -> StoreResult<Option<RuntimeStatusRecord>> {
        Ok(self.statuses.read().await.get(workspace_id).cloned())
    }

    async fn put_status(&self, record: RuntimeStatusRecord) -> StoreResult<()> {
        self.statuses
            .write()
            .await
            .insert(record.identity.workspace_id.clone(), record);
        Ok(())
    }

    async fn remove_status(&self, workspace_id: &str) -> StoreResult<Option<RuntimeStatusRecord>> {
        Ok(self.statuses.write().await.remove(workspace_id))
    }

    async fn list_statuses(&self) -> StoreResult<Vec<RuntimeStatusRecord>> {
        let mut all: Vec<_> = self.statuses.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.identity.workspace_id.cmp(&b.identity.workspace_id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_activity_is_monotonic() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store
            .save(WorkspaceActivity::new(
                "w1",
                WorkspaceStatus::Running,
                now,
                Duration::from_secs(60),
            ))
            .await
            .unwrap();

        let later = now + chrono::Duration::seconds(30);
        assert!(store.update_last_activity("w1", later).await.unwrap());
        assert!(
            store
                .update_last_activity("w1", now - chrono::Duration::seconds(5))
                .await
                .unwrap()
        );
        assert_eq!(store.get("w1").await.unwrap().unwrap().last_activity, later);

        assert!(!store.update_last_activity("missing", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_entering_running_stamps_times() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        store
            .save(WorkspaceActivity::new(
                "w1",
                WorkspaceStatus::Starting,
                t0,
                Duration::from_secs(60),
            ))
            .await
            .unwrap();
        assert!(store.get("w1").await.unwrap().unwrap().last_running.is_none());

        let t1 = t0 + chrono::Duration::seconds(90);
        store
            .set_status("w1", WorkspaceStatus::Running, t1)
            .await
            .unwrap();
        let record = store.get("w1").await.unwrap().unwrap();
        assert_eq!(record.last_running, Some(t1));
        assert_eq!(record.last_activity, t1);
    }

    #[tokio::test]
    async fn test_find_expired_idle() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let timeout = Duration::from_secs(300);
        for (id, idle_secs) in [("old", 301), ("fresh", 299)] {
            store
                .save(WorkspaceActivity::new(
                    id,
                    WorkspaceStatus::Running,
                    now - chrono::Duration::seconds(idle_secs),
                    timeout,
                ))
                .await
                .unwrap();
        }
        assert_eq!(store.find_expired_idle(now).await.unwrap(), vec!["old"]);
    }
}
