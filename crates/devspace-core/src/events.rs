// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle and permission events.
//!
//! Every event kind has its own typed [`Topic`]. Subscribers hold a
//! [`broadcast::Receiver`] for the kinds they care about; publishing never blocks and
//! never fails when nobody listens. Slow subscribers lose the oldest events
//! ([`broadcast::error::RecvError::Lagged`]) instead of slowing publishers down.
//!
//! [`BusEvent`] is the serializable union used to ship events between cluster nodes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::identity::RuntimeIdentity;
use crate::permissions::Acl;
use crate::status::{MachineStatus, WorkspaceStatus};

/// Default per-topic buffer.
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// A workspace reached RUNNING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStartedEvent {
    /// Identity of the started runtime.
    pub identity: RuntimeIdentity,
}

/// A workspace is about to be stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStoppingEvent {
    /// Workspace id.
    pub workspace_id: String,
    /// Who requested the stop (user id or `activity-checker`).
    pub stopped_by: Option<String>,
    /// Why the stop was requested.
    pub reason: Option<String>,
}

/// A workspace runtime is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStoppedEvent {
    /// Workspace id.
    pub workspace_id: String,
    /// Who requested the stop.
    pub stopped_by: Option<String>,
    /// Why the stop was requested.
    pub reason: Option<String>,
    /// Set when the runtime died abnormally.
    pub error: Option<String>,
}

/// Any workspace status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatusEvent {
    /// Workspace id.
    pub workspace_id: String,
    /// New status.
    pub status: WorkspaceStatus,
    /// Status before the transition.
    pub prev_status: Option<WorkspaceStatus>,
    /// Failure description for ERROR transitions and abnormal stops.
    pub error: Option<String>,
    /// Who requested a stop, for STOPPING/STOPPED transitions.
    pub stopped_by: Option<String>,
}

/// A machine changed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatusEvent {
    /// Identity of the runtime the machine belongs to.
    pub identity: RuntimeIdentity,
    /// Machine name.
    pub machine_name: String,
    /// New status.
    pub status: MachineStatus,
    /// Failure description for FAILED.
    pub error: Option<String>,
}

/// A runtime stopped without being asked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeAbnormalStopEvent {
    /// Identity of the dead runtime.
    pub identity: RuntimeIdentity,
    /// What the infrastructure observed.
    pub reason: String,
}

/// ACL entries were stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsAddedEvent {
    /// Who changed the permissions.
    pub changed_by: Option<String>,
    /// Stored entry.
    pub acl: Acl,
}

/// ACL entries were removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsRemovedEvent {
    /// Who changed the permissions.
    pub changed_by: Option<String>,
    /// Removed entry.
    pub acl: Acl,
}

/// Serializable union of every event kind, used for cluster replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusEvent {
    /// See [`WorkspaceStartedEvent`].
    Started(WorkspaceStartedEvent),
    /// See [`WorkspaceStoppingEvent`].
    Stopping(WorkspaceStoppingEvent),
    /// See [`WorkspaceStoppedEvent`].
    Stopped(WorkspaceStoppedEvent),
    /// See [`WorkspaceStatusEvent`].
    Status(WorkspaceStatusEvent),
    /// See [`MachineStatusEvent`].
    Machine(MachineStatusEvent),
    /// See [`PermissionsAddedEvent`].
    PermissionsAdded(PermissionsAddedEvent),
    /// See [`PermissionsRemovedEvent`].
    PermissionsRemoved(PermissionsRemovedEvent),
}

/// A typed broadcast channel for one event kind.
#[derive(Debug)]
pub struct Topic<E> {
    tx: broadcast::Sender<E>,
}

impl<E> Clone for Topic<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Clone> Topic<E> {
    /// Create a topic buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns the number of subscribers that will see it.
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Process-wide event bus: one [`Topic`] per event kind.
///
/// Cheap to clone; clones share the same topics.
#[derive(Debug, Clone)]
pub struct EventBus {
    started: Topic<WorkspaceStartedEvent>,
    stopping: Topic<WorkspaceStoppingEvent>,
    stopped: Topic<WorkspaceStoppedEvent>,
    status: Topic<WorkspaceStatusEvent>,
    machine: Topic<MachineStatusEvent>,
    abnormal_stop: Topic<RuntimeAbnormalStopEvent>,
    permissions_added: Topic<PermissionsAddedEvent>,
    permissions_removed: Topic<PermissionsRemovedEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus whose topics buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            started: Topic::new(capacity),
            stopping: Topic::new(capacity),
            stopped: Topic::new(capacity),
            status: Topic::new(capacity),
            machine: Topic::new(capacity),
            abnormal_stop: Topic::new(capacity),
            permissions_added: Topic::new(capacity),
            permissions_removed: Topic::new(capacity),
        }
    }

    /// WorkspaceStarted topic.
    pub fn started(&self) -> &Topic<WorkspaceStartedEvent> {
        &self.started
    }

    /// WorkspaceStopping topic.
    pub fn stopping(&self) -> &Topic<WorkspaceStoppingEvent> {
        &self.stopping
    }

    /// WorkspaceStopped topic.
    pub fn stopped(&self) -> &Topic<WorkspaceStoppedEvent> {
        &self.stopped
    }

    /// WorkspaceStatus topic.
    pub fn status(&self) -> &Topic<WorkspaceStatusEvent> {
        &self.status
    }

    /// MachineStatus topic.
    pub fn machine(&self) -> &Topic<MachineStatusEvent> {
        &self.machine
    }

    /// Abnormal runtime stop topic. Node-local, never replicated.
    pub fn abnormal_stop(&self) -> &Topic<RuntimeAbnormalStopEvent> {
        &self.abnormal_stop
    }

    /// PermissionsAdded topic.
    pub fn permissions_added(&self) -> &Topic<PermissionsAddedEvent> {
        &self.permissions_added
    }

    /// PermissionsRemoved topic.
    pub fn permissions_removed(&self) -> &Topic<PermissionsRemovedEvent> {
        &self.permissions_removed
    }

    /// Route a [`BusEvent`] to its topic.
    pub fn publish(&self, event: BusEvent) -> usize {
        match event {
            BusEvent::Started(e) => self.started.publish(e),
            BusEvent::Stopping(e) => self.stopping.publish(e),
            BusEvent::Stopped(e) => self.stopped.publish(e),
            BusEvent::Status(e) => self.status.publish(e),
            BusEvent::Machine(e) => self.machine.publish(e),
            BusEvent::PermissionsAdded(e) => self.permissions_added.publish(e),
            BusEvent::PermissionsRemoved(e) => self.permissions_removed.publish(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        let delivered = bus.stopped().publish(WorkspaceStoppedEvent {
            workspace_id: "w1".into(),
            stopped_by: None,
            reason: None,
            error: None,
        });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_topics_are_typed_and_isolated() {
        let bus = EventBus::default();
        let mut started = bus.started().subscribe();
        let mut stopping = bus.stopping().subscribe();

        let identity = RuntimeIdentity::new("w1", "default", "alice", "alice");
        bus.publish(BusEvent::Started(WorkspaceStartedEvent {
            identity: identity.clone(),
        }));

        assert_eq!(started.recv().await.unwrap().identity, identity);
        assert!(matches!(
            stopping.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_clones_share_topics() {
        let bus = EventBus::default();
        let clone = bus.clone();
        let mut rx = bus.stopping().subscribe();
        clone.stopping().publish(WorkspaceStoppingEvent {
            workspace_id: "w2".into(),
            stopped_by: Some("activity-checker".into()),
            reason: Some("Workspace idle timeout exceeded".into()),
        });
        assert_eq!(rx.recv().await.unwrap().workspace_id, "w2");
    }

    #[test]
    fn test_bus_event_wire_form() {
        let event = BusEvent::Stopping(WorkspaceStoppingEvent {
            workspace_id: "w1".into(),
            stopped_by: None,
            reason: None,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "stopping");
        assert_eq!(json["workspace_id"], "w1");
    }
}
