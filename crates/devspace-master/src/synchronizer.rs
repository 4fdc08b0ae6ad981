// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-workspace lifecycle serialization.
//!
//! Every start and stop runs inside [`StartSynchronizer::with_workspace_lock`], which holds
//! the cluster-wide write lock on the workspace id for the duration of the operation. Per
//! workspace the synchronizer moves through:
//!
//! ```text
//! IDLE ──▶ LOCKING ──▶ STARTING | STOPPING ──▶ IDLE
//! ```
//!
//! A lock that cannot be acquired within the bounded wait surfaces as
//! [`RuntimeError::Conflict`] and is never retried here.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use devspace_core::{InfrastructureError, Result, RuntimeError};
use tracing::{debug, warn};

use crate::cluster::{Cluster, LockError};

/// Lifecycle operation guarded by the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOperation {
    /// Workspace start.
    Start,
    /// Workspace stop.
    Stop,
}

impl fmt::Display for LifecycleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Local synchronizer state of one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing in flight on this node.
    Idle,
    /// Waiting for the write lock.
    Locking,
    /// Holding the lock for a start.
    Starting,
    /// Holding the lock for a stop.
    Stopping,
}

#[derive(Debug, Default)]
struct Entry {
    waiting: usize,
    active: Option<LifecycleOperation>,
}

type States = Arc<Mutex<HashMap<String, Entry>>>;

fn states(states: &States) -> MutexGuard<'_, HashMap<String, Entry>> {
    states.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps the state table consistent on every exit path, cancellation included.
struct StateGuard {
    states: States,
    workspace_id: String,
    operation: LifecycleOperation,
    locked: bool,
}

impl StateGuard {
    fn enter(states_ref: &States, workspace_id: &str, operation: LifecycleOperation) -> Self {
        states(states_ref)
            .entry(workspace_id.to_string())
            .or_default()
            .waiting += 1;
        Self {
            states: states_ref.clone(),
            workspace_id: workspace_id.to_string(),
            operation,
            locked: false,
        }
    }

    fn locked(&mut self) {
        let mut table = states(&self.states);
        if let Some(entry) = table.get_mut(&self.workspace_id) {
            entry.waiting = entry.waiting.saturating_sub(1);
            entry.active = Some(self.operation);
        }
        self.locked = true;
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        let mut table = states(&self.states);
        let remove = match table.get_mut(&self.workspace_id) {
            Some(entry) => {
                if self.locked {
                    entry.active = None;
                } else {
                    entry.waiting = entry.waiting.saturating_sub(1);
                }
                entry.waiting == 0 && entry.active.is_none()
            }
            None => false,
        };
        if remove {
            table.remove(&self.workspace_id);
        }
    }
}

/// Cluster-wide per-workspace mutual exclusion.
#[derive(Clone)]
pub struct StartSynchronizer {
    cluster: Cluster,
    lock_timeout: Duration,
    states: States,
}

impl StartSynchronizer {
    /// Synchronizer over `cluster`, waiting at most `lock_timeout` for a lock.
    pub fn new(cluster: Cluster, lock_timeout: Duration) -> Self {
        Self {
            cluster,
            lock_timeout,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cluster this synchronizer locks through.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Bounded lock wait.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Current local state of `workspace_id`.
    pub fn state(&self, workspace_id: &str) -> SyncState {
        match states(&self.states).get(workspace_id) {
            Some(Entry {
                active: Some(LifecycleOperation::Start),
                ..
            }) => SyncState::Starting,
            Some(Entry {
                active: Some(LifecycleOperation::Stop),
                ..
            }) => SyncState::Stopping,
            Some(entry) if entry.waiting > 0 => SyncState::Locking,
            _ => SyncState::Idle,
        }
    }

    /// Run `operation` while holding the write lock on `workspace_id`.
    ///
    /// The lock is released on every exit path. If it cannot be acquired within the
    /// bounded wait the call fails with [`RuntimeError::Conflict`] without running
    /// `operation`.
    pub async fn with_workspace_lock<T, F, Fut>(
        &self,
        workspace_id: &str,
        operation: LifecycleOperation,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = StateGuard::enter(&self.states, workspace_id, operation);

        let lock = match self
            .cluster
            .locks()
            .write_lock(workspace_id, self.lock_timeout)
            .await
        {
            Ok(lock) => lock,
            Err(LockError::Timeout { waited, .. }) => {
                warn!(
                    workspace_id,
                    operation = %operation,
                    waited_ms = waited.as_millis() as u64,
                    "Workspace lock contended"
                );
                return Err(RuntimeError::Conflict(format!(
                    "Workspace '{workspace_id}' {operation} is already in progress elsewhere"
                )));
            }
            Err(LockError::NoQuorum { members, expected }) => {
                warn!(
                    workspace_id,
                    operation = %operation,
                    members,
                    expected,
                    "Refusing lifecycle operation without quorum"
                );
                return Err(RuntimeError::Conflict(format!(
                    "Workspace '{workspace_id}' {operation} refused: {members} of {expected} cluster members reachable"
                )));
            }
            Err(e) => return Err(InfrastructureError::Internal(e.to_string()).into()),
        };

        state.locked();
        debug!(workspace_id, operation = %operation, "Workspace lock acquired");
        let result = body().await;
        lock.release().await;
        debug!(workspace_id, operation = %operation, ok = result.is_ok(), "Workspace lock released");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devspace_core::EventBus;

    fn synchronizer(timeout: Duration) -> StartSynchronizer {
        StartSynchronizer::new(Cluster::single_node("n1", EventBus::default()), timeout)
    }

    #[tokio::test]
    async fn test_runs_operation_under_lock() {
        let sync = synchronizer(Duration::from_secs(1));
        let observed = sync
            .with_workspace_lock("w1", LifecycleOperation::Start, || async {
                Ok((
                    sync.state("w1"),
                    sync.cluster().locks().is_held_locally("w1"),
                ))
            })
            .await
            .unwrap();
        assert_eq!(observed, (SyncState::Starting, true));
        assert_eq!(sync.state("w1"), SyncState::Idle);
        assert!(!sync.cluster().locks().is_held_locally("w1"));
    }

    #[tokio::test]
    async fn test_contention_is_conflict() {
        let sync = synchronizer(Duration::from_millis(50));
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let sync = sync.clone();
            tokio::spawn(async move {
                sync.with_workspace_lock("w1", LifecycleOperation::Start, || async move {
                    entered_tx.send(()).unwrap();
                    finish_rx.await.unwrap();
                    Ok(())
                })
                .await
            })
        };
        entered_rx.await.unwrap();

        let err = sync
            .with_workspace_lock("w1", LifecycleOperation::Stop, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "{err}");
        assert_eq!(sync.state("w1"), SyncState::Starting);

        // Other workspaces are not affected.
        sync.with_workspace_lock("w2", LifecycleOperation::Stop, || async { Ok(()) })
            .await
            .unwrap();

        finish_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(sync.state("w1"), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_lock_released_after_error() {
        let sync = synchronizer(Duration::from_millis(100));
        let err = sync
            .with_workspace_lock::<(), _, _>("w1", LifecycleOperation::Start, || async {
                Err(RuntimeError::NotFound("w1".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        sync.with_workspace_lock("w1", LifecycleOperation::Stop, || async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_operation_releases_lock() {
        let sync = synchronizer(Duration::from_millis(200));
        let pending = sync.with_workspace_lock("w1", LifecycleOperation::Start, || async {
            std::future::pending::<Result<()>>().await
        });
        let _ = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert_eq!(sync.state("w1"), SyncState::Idle);

        // The dropped guard releases asynchronously.
        tokio::time::sleep(Duration::from_millis(10)).await;
        sync.with_workspace_lock("w1", LifecycleOperation::Stop, || async { Ok(()) })
            .await
            .unwrap();
    }
}
