// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster membership, event replication and distributed locking.
//!
//! Master nodes join a named group through a [`GroupTransport`]. The group delivers
//! point-to-point and broadcast [`ClusterMessage`]s plus membership [`View`]s. A [`Cluster`]
//! handle is built once at startup and passed to everything that needs cluster-wide
//! coordination; nothing looks it up globally.
//!
//! Without group configuration the handle degrades to [`Cluster::single_node`]: locks are
//! in-process and events stay on the local bus.

pub mod lock;
pub mod memory;
pub mod tcp;

pub use self::lock::{DistributedLockService, LockError, LockGuard, ReadGuard};
pub use self::memory::MemoryGroup;
pub use self::tcp::{DiscoveryConfig, TcpGroup, TcpGroupConfig};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use devspace_core::EventBus;
use devspace_core::events::BusEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Id of a master node.
pub type NodeId = String;

/// Cluster errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The target node is not reachable from this node.
    #[error("Node '{0}' is unreachable")]
    Unreachable(NodeId),

    /// This node already left the group.
    #[error("Not a member of group '{0}'")]
    NotMember(String),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Discovery configuration is unusable.
    #[error("Invalid cluster configuration: {0}")]
    Config(String),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Group membership as seen by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Monotonic view number.
    pub id: u64,
    /// Live reachable members, sorted.
    pub members: Vec<NodeId>,
}

impl View {
    /// View over the given members.
    pub fn new(id: u64, mut members: Vec<NodeId>) -> Self {
        members.sort();
        members.dedup();
        Self { id, members }
    }

    /// The member granting locks: the first member of the view.
    pub fn coordinator(&self) -> Option<&str> {
        self.members.first().map(String::as_str)
    }

    /// Whether `node` is a member.
    pub fn contains(&self, node: &str) -> bool {
        self.members.iter().any(|m| m == node)
    }
}

/// Identifier of one lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRequestId {
    /// Requesting node.
    pub node: NodeId,
    /// Per-node sequence number.
    pub seq: u64,
}

/// Messages exchanged between master nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    /// Ask the coordinator for the write lock on `key`.
    LockRequest {
        /// Lock key.
        key: String,
        /// Request id.
        request: LockRequestId,
    },
    /// The coordinator granted `request`.
    LockGranted {
        /// Lock key.
        key: String,
        /// Request id.
        request: LockRequestId,
    },
    /// Release a held lock or withdraw a waiting request.
    LockRelease {
        /// Lock key.
        key: String,
        /// Request id.
        request: LockRequestId,
    },
    /// Tell a new coordinator that `request` holds `key`.
    LockReassert {
        /// Lock key.
        key: String,
        /// Request id.
        request: LockRequestId,
    },
    /// A lifecycle or permission event to re-publish locally.
    Event(BusEvent),
}

/// Something delivered by the group to this node.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A message from another member.
    Message {
        /// Sender.
        from: NodeId,
        /// Payload.
        message: ClusterMessage,
    },
    /// Membership changed.
    ViewChanged(View),
}

/// A group-communication channel.
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// This node's id.
    fn local_node(&self) -> &str;

    /// Name of the joined group.
    fn group_name(&self) -> &str;

    /// Latest view delivered to this node.
    fn view(&self) -> View;

    /// Send a message to one member.
    async fn send(&self, to: &str, message: ClusterMessage) -> Result<()>;

    /// Send a message to every other member of the current view.
    async fn broadcast(&self, message: ClusterMessage) -> Result<()>;

    /// Leave the group.
    async fn leave(&self);
}

/// Lock-service behavior when the group loses its majority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionPolicy {
    /// Every partition elects its own coordinator and keeps granting locks. Available, but
    /// two partitions may both drive the same workspace.
    #[default]
    FailOpen,
    /// Refuse new locks while the view holds no majority of `expected_members`.
    RequireQuorum {
        /// Configured cluster size.
        expected_members: usize,
    },
}

impl PartitionPolicy {
    /// Whether a view of `members` nodes may grant locks.
    pub fn allows(&self, members: usize) -> bool {
        match self {
            Self::FailOpen => true,
            Self::RequireQuorum { expected_members } => members * 2 > *expected_members,
        }
    }
}

/// Cluster settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Group name shared by all masters.
    pub group_name: String,
    /// Discovery file listing the members.
    pub discovery_file: PathBuf,
    /// Partition behavior.
    pub policy: PartitionPolicy,
}

struct ClusterInner {
    node_id: NodeId,
    transport: Option<Arc<dyn GroupTransport>>,
    locks: DistributedLockService,
    bus: EventBus,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the cluster this node belongs to.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// A cluster of one: in-process locks, local events only.
    pub fn single_node(node_id: impl Into<NodeId>, bus: EventBus) -> Self {
        let node_id = node_id.into();
        Self {
            inner: Arc::new(ClusterInner {
                locks: DistributedLockService::local(node_id.clone()),
                node_id,
                transport: None,
                bus,
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Join a group through `transport`, consuming its deliveries.
    ///
    /// Must be called inside a tokio runtime.
    pub fn join(
        transport: Arc<dyn GroupTransport>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        bus: EventBus,
        policy: PartitionPolicy,
    ) -> Self {
        let node_id = transport.local_node().to_string();
        let locks = DistributedLockService::clustered(transport.clone(), policy);
        info!(
            node_id = %node_id,
            group = %transport.group_name(),
            members = transport.view().members.len(),
            "Joined cluster"
        );

        let dispatch_locks = locks.clone();
        let dispatch_bus = bus.clone();
        let dispatch_node = node_id.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                match delivery {
                    Delivery::ViewChanged(view) => {
                        debug!(node_id = %dispatch_node, view_id = view.id, members = ?view.members, "View changed");
                        dispatch_locks.on_view_change(view).await;
                    }
                    Delivery::Message {
                        from,
                        message: ClusterMessage::Event(event),
                    } => {
                        debug!(node_id = %dispatch_node, from = %from, "Replicated event received");
                        dispatch_bus.publish(event);
                    }
                    Delivery::Message { from, message } => {
                        dispatch_locks.handle_message(&from, message).await;
                    }
                }
            }
            debug!(node_id = %dispatch_node, "Cluster dispatcher stopped");
        });

        Self {
            inner: Arc::new(ClusterInner {
                node_id,
                transport: Some(transport),
                locks,
                bus,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Local event bus.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Distributed lock service.
    pub fn locks(&self) -> &DistributedLockService {
        &self.inner.locks
    }

    /// Current view; a single-member view without a group.
    pub fn view(&self) -> View {
        match &self.inner.transport {
            Some(transport) => transport.view(),
            None => View::new(0, vec![self.inner.node_id.clone()]),
        }
    }

    /// Whether this node is part of a multi-node group.
    pub fn is_clustered(&self) -> bool {
        self.inner.transport.is_some()
    }

    /// Publish an event locally and replicate it to the other members.
    ///
    /// Replication is fire-and-forget.
    pub async fn publish(&self, event: BusEvent) {
        if let Some(transport) = &self.inner.transport
            && let Err(e) = transport
                .broadcast(ClusterMessage::Event(event.clone()))
                .await
        {
            warn!(node_id = %self.inner.node_id, error = %e, "Failed to replicate event");
        }
        self.inner.bus.publish(event);
    }

    /// Leave the group and stop dispatching deliveries.
    pub async fn leave(&self) {
        if let Some(transport) = &self.inner.transport {
            transport.leave().await;
            info!(node_id = %self.inner.node_id, "Left cluster");
        }
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_coordinator_is_smallest_member() {
        let view = View::new(3, vec!["c".into(), "a".into(), "b".into(), "a".into()]);
        assert_eq!(view.members, vec!["a", "b", "c"]);
        assert_eq!(view.coordinator(), Some("a"));
        assert!(view.contains("b"));
        assert!(!view.contains("d"));
    }

    #[test]
    fn test_quorum_policy() {
        let policy = PartitionPolicy::RequireQuorum {
            expected_members: 3,
        };
        assert!(policy.allows(2));
        assert!(!policy.allows(1));
        assert!(PartitionPolicy::FailOpen.allows(1));

        let even = PartitionPolicy::RequireQuorum {
            expected_members: 4,
        };
        assert!(!even.allows(2));
        assert!(even.allows(3));
    }

    #[test]
    fn test_message_wire_form() {
        let message = ClusterMessage::LockRequest {
            key: "w1".into(),
            request: LockRequestId {
                node: "a".into(),
                seq: 7,
            },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "lock_request");
        assert_eq!(json["request"]["seq"], 7);
        let back: ClusterMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }
}
