// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide read/write lock keyed by workspace id.
//!
//! The coordinator (first member of the current view) owns the lock table. Other nodes send
//! it [`ClusterMessage::LockRequest`]s and wait for a grant; waiters are granted in FIFO
//! order. Write locks are exclusive across the cluster. Read locks are no-ops: status reads
//! never serialize against writers and may observe a state that is about to change.
//!
//! # Membership changes
//!
//! - Locks and queued requests of departed members are dropped by the coordinator.
//! - When the coordinator changes, every node re-asserts the locks it holds and re-sends
//!   its queued requests to the new coordinator.
//! - Under [`PartitionPolicy::FailOpen`] each side of a partition has its own coordinator,
//!   so both sides may hold the same key until the partition heals. A conflicting
//!   re-assertion after the heal is logged.
//! - Under [`PartitionPolicy::RequireQuorum`] acquisitions fail fast with
//!   [`LockError::NoQuorum`] while the view holds no majority.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{
    ClusterError, ClusterMessage, GroupTransport, LockRequestId, NodeId, PartitionPolicy, View,
};

/// Lock acquisition failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The lock was not granted within the bounded wait.
    #[error("Timed out after {}ms waiting for lock '{key}'", waited.as_millis())]
    Timeout {
        /// Lock key.
        key: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The current view holds no majority and the policy requires one.
    #[error("No quorum: {members} of {expected} members reachable")]
    NoQuorum {
        /// Members in the current view.
        members: usize,
        /// Configured cluster size.
        expected: usize,
    },

    /// The group channel failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[derive(Debug, Default)]
struct KeyState {
    holder: Option<LockRequestId>,
    waiters: VecDeque<LockRequestId>,
}

/// Coordinator-side lock table.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    keys: HashMap<String, KeyState>,
}

impl LockTable {
    /// Grant `request` if the key is free, otherwise queue it. Returns whether it holds.
    pub(crate) fn acquire(&mut self, key: &str, request: LockRequestId) -> bool {
        let state = self.keys.entry(key.to_string()).or_default();
        match &state.holder {
            None => {
                state.holder = Some(request);
                true
            }
            Some(holder) if *holder == request => true,
            Some(_) => {
                if !state.waiters.contains(&request) {
                    state.waiters.push_back(request);
                }
                false
            }
        }
    }

    /// Release a held lock or withdraw a queued request. Returns the next holder, if any.
    pub(crate) fn release(&mut self, key: &str, request: &LockRequestId) -> Option<LockRequestId> {
        let state = self.keys.get_mut(key)?;
        let mut granted = None;
        if state.holder.as_ref() == Some(request) {
            state.holder = state.waiters.pop_front();
            granted = state.holder.clone();
        } else {
            state.waiters.retain(|w| w != request);
        }
        if state.holder.is_none() && state.waiters.is_empty() {
            self.keys.remove(key);
        }
        granted
    }

    /// Drop every lock and request of nodes not in `members`. Returns the new holders.
    pub(crate) fn retain_members(&mut self, members: &[NodeId]) -> Vec<(String, LockRequestId)> {
        let alive = |id: &LockRequestId| members.iter().any(|m| *m == id.node);
        let mut granted = Vec::new();
        for (key, state) in self.keys.iter_mut() {
            state.waiters.retain(|w| alive(w));
            if state.holder.as_ref().is_some_and(|h| !alive(h)) {
                state.holder = state.waiters.pop_front();
                if let Some(next) = &state.holder {
                    granted.push((key.clone(), next.clone()));
                }
            }
        }
        self.keys
            .retain(|_, state| state.holder.is_some() || !state.waiters.is_empty());
        granted
    }

    /// Record that `request` already holds `key`. Returns false if someone else holds it.
    pub(crate) fn reassert(&mut self, key: &str, request: LockRequestId) -> bool {
        let state = self.keys.entry(key.to_string()).or_default();
        state.waiters.retain(|w| *w != request);
        match &state.holder {
            None => {
                state.holder = Some(request);
                true
            }
            Some(holder) => *holder == request,
        }
    }

    /// Current holder of `key`.
    pub(crate) fn holder(&self, key: &str) -> Option<&LockRequestId> {
        self.keys.get(key).and_then(|s| s.holder.as_ref())
    }

    fn clear(&mut self) {
        self.keys.clear();
    }
}

struct PendingRequest {
    key: String,
    granted: oneshot::Sender<()>,
}

struct LockInner {
    node_id: NodeId,
    transport: Option<Arc<dyn GroupTransport>>,
    policy: PartitionPolicy,
    seq: AtomicU64,
    view: Mutex<View>,
    table: Mutex<LockTable>,
    pending: Mutex<HashMap<LockRequestId, PendingRequest>>,
    held: Mutex<HashMap<LockRequestId, String>>,
}

type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cluster-membership-aware read/write lock service.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct DistributedLockService {
    inner: Arc<LockInner>,
}

impl DistributedLockService {
    /// In-process locks for a node without a group.
    pub fn local(node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        let view = View::new(0, vec![node_id.clone()]);
        Self::build(node_id, None, PartitionPolicy::FailOpen, view)
    }

    /// Locks coordinated through a group.
    pub fn clustered(transport: Arc<dyn GroupTransport>, policy: PartitionPolicy) -> Self {
        let node_id = transport.local_node().to_string();
        let view = transport.view();
        Self::build(node_id, Some(transport), policy, view)
    }

    fn build(
        node_id: NodeId,
        transport: Option<Arc<dyn GroupTransport>>,
        policy: PartitionPolicy,
        view: View,
    ) -> Self {
        Self {
            inner: Arc::new(LockInner {
                node_id,
                transport,
                policy,
                seq: AtomicU64::new(1),
                view: Mutex::new(view),
                table: Mutex::new(LockTable::default()),
                pending: Mutex::new(HashMap::new()),
                held: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Read lock on `key`. Never blocks and never excludes writers.
    pub fn read_lock(&self, key: &str) -> ReadGuard {
        ReadGuard {
            key: key.to_string(),
        }
    }

    /// Exclusive cluster-wide lock on `key`, waiting at most `timeout`.
    pub async fn write_lock(&self, key: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        let members = locked(&self.inner.view).members.len();
        if !self.inner.policy.allows(members) {
            let expected = match self.inner.policy {
                PartitionPolicy::RequireQuorum { expected_members } => expected_members,
                PartitionPolicy::FailOpen => members,
            };
            return Err(LockError::NoQuorum { members, expected });
        }

        let request = LockRequestId {
            node: self.inner.node_id.clone(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
        };
        let (tx, rx) = oneshot::channel();
        locked(&self.inner.pending).insert(
            request.clone(),
            PendingRequest {
                key: key.to_string(),
                granted: tx,
            },
        );

        self.submit(key, &request).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                locked(&self.inner.held).insert(request.clone(), key.to_string());
                debug!(key, node_id = %self.inner.node_id, seq = request.seq, "Write lock acquired");
                Ok(LockGuard {
                    service: Some(self.clone()),
                    key: key.to_string(),
                    request,
                })
            }
            _ => {
                // A grant racing with the timeout finds no pending entry and is released
                // by `handle_message`.
                let still_pending = locked(&self.inner.pending).remove(&request).is_some();
                if still_pending {
                    self.send_release(key, &request).await;
                } else if locked(&self.inner.held).contains_key(&request) {
                    self.release(key, &request).await;
                }
                warn!(key, node_id = %self.inner.node_id, timeout_ms = timeout.as_millis() as u64, "Write lock wait timed out");
                Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    /// Whether this node currently holds a write lock on `key`.
    pub fn is_held_locally(&self, key: &str) -> bool {
        locked(&self.inner.held).values().any(|k| k == key)
    }

    fn coordinator(&self) -> Option<NodeId> {
        locked(&self.inner.view).coordinator().map(str::to_string)
    }

    fn is_coordinator(&self) -> bool {
        match self.coordinator() {
            Some(coordinator) => coordinator == self.inner.node_id,
            None => true,
        }
    }

    /// Route a new request to the coordinator, or grant it from the local table.
    async fn submit(&self, key: &str, request: &LockRequestId) {
        if let (Some(transport), Some(coordinator)) = (&self.inner.transport, self.coordinator())
            && coordinator != self.inner.node_id
        {
            let message = ClusterMessage::LockRequest {
                key: key.to_string(),
                request: request.clone(),
            };
            match transport.send(&coordinator, message).await {
                Ok(()) => return,
                Err(e) => {
                    // The view will change once the failure detector notices; meanwhile
                    // fall back to the local table.
                    warn!(key, coordinator = %coordinator, error = %e, "Lock coordinator unreachable, granting locally");
                }
            }
        }
        let granted = locked(&self.inner.table).acquire(key, request.clone());
        if granted {
            self.deliver_grant(key, request.clone()).await;
        }
    }

    async fn send_release(&self, key: &str, request: &LockRequestId) {
        if let (Some(transport), Some(coordinator)) = (&self.inner.transport, self.coordinator())
            && coordinator != self.inner.node_id
        {
            let message = ClusterMessage::LockRelease {
                key: key.to_string(),
                request: request.clone(),
            };
            match transport.send(&coordinator, message).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(key, coordinator = %coordinator, error = %e, "Failed to send lock release");
                }
            }
        }
        let next = locked(&self.inner.table).release(key, request);
        if let Some(next) = next {
            self.deliver_grant(key, next).await;
        }
    }

    /// Release a lock held by this node.
    async fn release(&self, key: &str, request: &LockRequestId) {
        locked(&self.inner.held).remove(request);
        self.send_release(key, request).await;
        debug!(key, node_id = %self.inner.node_id, seq = request.seq, "Write lock released");
    }

    /// Hand a grant to a local waiter or to the requesting node.
    fn deliver_grant<'a>(&'a self, key: &'a str, request: LockRequestId) -> BoxFuture<'a> {
        Box::pin(async move {
            if request.node == self.inner.node_id {
                self.complete_local(key, request).await;
                return;
            }
            let Some(transport) = &self.inner.transport else {
                return;
            };
            let message = ClusterMessage::LockGranted {
                key: key.to_string(),
                request: request.clone(),
            };
            if let Err(e) = transport.send(&request.node, message).await {
                warn!(key, node = %request.node, error = %e, "Failed to deliver lock grant, releasing");
                let next = locked(&self.inner.table).release(key, &request);
                if let Some(next) = next {
                    let retry: BoxFuture<'_> = Box::pin(self.deliver_grant(key, next));
                    retry.await;
                }
            }
        })
    }

    /// Wake a local waiter; if it already gave up, release on its behalf.
    async fn complete_local(&self, key: &str, request: LockRequestId) {
        let pending = locked(&self.inner.pending).remove(&request);
        let delivered = match pending {
            Some(p) => p.granted.send(()).is_ok(),
            None => false,
        };
        if !delivered {
            debug!(key, seq = request.seq, "Grant arrived for abandoned request, releasing");
            let release: BoxFuture<'_> = Box::pin(self.send_release(key, &request));
            release.await;
        }
    }

    /// Handle a lock message from another member.
    pub(crate) async fn handle_message(&self, from: &str, message: ClusterMessage) {
        match message {
            ClusterMessage::LockRequest { key, request } => {
                if !self.is_coordinator() {
                    debug!(key = %key, from, "Lock request received by non-coordinator");
                }
                let granted = locked(&self.inner.table).acquire(&key, request.clone());
                if granted {
                    self.deliver_grant(&key, request).await;
                }
            }
            ClusterMessage::LockGranted { key, request } => {
                self.complete_local(&key, request).await;
            }
            ClusterMessage::LockRelease { key, request } => {
                let next = locked(&self.inner.table).release(&key, &request);
                if let Some(next) = next {
                    self.deliver_grant(&key, next).await;
                }
            }
            ClusterMessage::LockReassert { key, request } => {
                let accepted = locked(&self.inner.table).reassert(&key, request.clone());
                if !accepted {
                    let holder = locked(&self.inner.table).holder(&key).cloned();
                    warn!(
                        key = %key,
                        from,
                        holder = ?holder,
                        "Conflicting lock re-assertion after membership change"
                    );
                }
            }
            ClusterMessage::Event(_) => {}
        }
    }

    /// Apply a new membership view.
    pub(crate) async fn on_view_change(&self, view: View) {
        let (old_coordinator, new_coordinator) = {
            let mut current = locked(&self.inner.view);
            let old = current.coordinator().map(str::to_string);
            *current = view.clone();
            (old, view.coordinator().map(str::to_string))
        };
        let me = self.inner.node_id.clone();
        let was_coordinator = old_coordinator.as_deref() == Some(me.as_str());
        let is_coordinator = new_coordinator.as_deref() == Some(me.as_str());

        if was_coordinator && !is_coordinator {
            locked(&self.inner.table).clear();
        }

        if is_coordinator {
            let granted = locked(&self.inner.table).retain_members(&view.members);
            for (key, next) in granted {
                self.deliver_grant(&key, next).await;
            }
        }

        if old_coordinator == new_coordinator {
            return;
        }

        let held: Vec<(LockRequestId, String)> = locked(&self.inner.held)
            .iter()
            .map(|(r, k)| (r.clone(), k.clone()))
            .collect();
        let pending: Vec<(LockRequestId, String)> = locked(&self.inner.pending)
            .iter()
            .map(|(r, p)| (r.clone(), p.key.clone()))
            .collect();
        debug!(
            node_id = %me,
            coordinator = ?new_coordinator,
            held = held.len(),
            pending = pending.len(),
            "Coordinator changed, re-asserting locks"
        );

        for (request, key) in held {
            if is_coordinator {
                if !locked(&self.inner.table).reassert(&key, request) {
                    warn!(key = %key, "Local lock conflicts with table of new coordinator");
                }
            } else if let (Some(transport), Some(coordinator)) =
                (&self.inner.transport, &new_coordinator)
                && let Err(e) = transport
                    .send(coordinator, ClusterMessage::LockReassert { key: key.clone(), request })
                    .await
            {
                warn!(key = %key, error = %e, "Failed to re-assert lock");
            }
        }
        for (request, key) in pending {
            self.submit(&key, &request).await;
        }
    }
}

/// No-op read guard. See [`DistributedLockService::read_lock`].
#[derive(Debug)]
pub struct ReadGuard {
    key: String,
}

impl ReadGuard {
    /// Locked key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Held write lock. Released by [`LockGuard::release`] or, as a fallback, on drop.
pub struct LockGuard {
    service: Option<DistributedLockService>,
    key: String,
    request: LockRequestId,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("request", &self.request)
            .finish()
    }
}

impl LockGuard {
    /// Locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock now.
    pub async fn release(mut self) {
        if let Some(service) = self.service.take() {
            service.release(&self.key, &self.request).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(service) = self.service.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let request = self.request.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    service.release(&key, &request).await;
                });
            }
            Err(_) => {
                warn!(key = %key, "Lock guard dropped outside a runtime; lock not released");
            }
        }
    }
}
