// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process group with crash and partition injection.
//!
//! Every node joined to the same [`MemoryGroup`] shares its state. Views are computed per
//! connected component: after [`MemoryGroup::partition`] each side sees only its own members
//! and elects its own coordinator, exactly what a real group does when the network splits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ClusterError, ClusterMessage, Delivery, GroupTransport, NodeId, Result, View};

struct Member {
    tx: mpsc::UnboundedSender<Delivery>,
    view: View,
}

#[derive(Default)]
struct GroupState {
    next_view_id: u64,
    members: BTreeMap<NodeId, Member>,
    partitions: Vec<BTreeSet<NodeId>>,
}

impl GroupState {
    /// Members reachable from `node`, including itself.
    fn component(&self, node: &str) -> Vec<NodeId> {
        if self.partitions.is_empty() {
            return self.members.keys().cloned().collect();
        }
        match self.partitions.iter().find(|p| p.contains(node)) {
            Some(side) => self
                .members
                .keys()
                .filter(|m| side.contains(*m))
                .cloned()
                .collect(),
            None => vec![node.to_string()],
        }
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        self.members.contains_key(to) && self.component(from).iter().any(|m| m == to)
    }

    /// Recompute views and notify members whose view changed.
    fn publish_views(&mut self) {
        let nodes: Vec<NodeId> = self.members.keys().cloned().collect();
        for node in nodes {
            let members = self.component(&node);
            let changed = self
                .members
                .get(&node)
                .is_some_and(|m| m.view.members != members);
            if !changed {
                continue;
            }
            self.next_view_id += 1;
            let view = View::new(self.next_view_id, members);
            if let Some(member) = self.members.get_mut(&node) {
                member.view = view.clone();
                let _ = member.tx.send(Delivery::ViewChanged(view));
            }
        }
    }
}

/// Shared in-process group.
#[derive(Clone)]
pub struct MemoryGroup {
    name: String,
    state: Arc<Mutex<GroupState>>,
}

impl MemoryGroup {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(GroupState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join `node_id`. Every member receives the new view.
    pub fn join(
        &self,
        node_id: impl Into<NodeId>,
    ) -> (Arc<dyn GroupTransport>, mpsc::UnboundedReceiver<Delivery>) {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            state.members.insert(
                node_id.clone(),
                Member {
                    tx,
                    view: View::new(0, Vec::new()),
                },
            );
            state.publish_views();
        }
        debug!(group = %self.name, node_id = %node_id, "Node joined memory group");
        let transport = MemoryTransport {
            group: self.clone(),
            node: node_id,
        };
        (Arc::new(transport), rx)
    }

    /// Remove `node_id` abruptly, as if its process died.
    pub fn crash(&self, node_id: &str) {
        let mut state = self.state();
        if state.members.remove(node_id).is_some() {
            debug!(group = %self.name, node_id, "Node crashed");
            state.publish_views();
        }
    }

    /// Split the group. Nodes not listed in any side end up alone.
    pub fn partition(&self, sides: &[&[&str]]) {
        let mut state = self.state();
        state.partitions = sides
            .iter()
            .map(|side| side.iter().map(|n| n.to_string()).collect())
            .collect();
        debug!(group = %self.name, sides = ?state.partitions, "Group partitioned");
        state.publish_views();
    }

    /// Reconnect every member.
    pub fn heal(&self) {
        let mut state = self.state();
        state.partitions.clear();
        debug!(group = %self.name, "Partition healed");
        state.publish_views();
    }

    /// Current members, across partitions.
    pub fn members(&self) -> Vec<NodeId> {
        self.state().members.keys().cloned().collect()
    }
}

struct MemoryTransport {
    group: MemoryGroup,
    node: NodeId,
}

impl MemoryTransport {
    fn deliver(&self, state: &GroupState, to: &str, message: ClusterMessage) -> Result<()> {
        if !state.reachable(&self.node, to) {
            return Err(ClusterError::Unreachable(to.to_string()));
        }
        let member = state
            .members
            .get(to)
            .ok_or_else(|| ClusterError::Unreachable(to.to_string()))?;
        member
            .tx
            .send(Delivery::Message {
                from: self.node.clone(),
                message,
            })
            .map_err(|_| ClusterError::Unreachable(to.to_string()))
    }
}

#[async_trait]
impl GroupTransport for MemoryTransport {
    fn local_node(&self) -> &str {
        &self.node
    }

    fn group_name(&self) -> &str {
        &self.group.name
    }

    fn view(&self) -> View {
        self.group
            .state()
            .members
            .get(&self.node)
            .map(|m| m.view.clone())
            .unwrap_or_else(|| View::new(0, Vec::new()))
    }

    async fn send(&self, to: &str, message: ClusterMessage) -> Result<()> {
        let state = self.group.state();
        if !state.members.contains_key(&self.node) {
            return Err(ClusterError::NotMember(self.group.name.clone()));
        }
        self.deliver(&state, to, message)
    }

    async fn broadcast(&self, message: ClusterMessage) -> Result<()> {
        let state = self.group.state();
        if !state.members.contains_key(&self.node) {
            return Err(ClusterError::NotMember(self.group.name.clone()));
        }
        for peer in state.component(&self.node) {
            if peer != self.node {
                self.deliver(&state, &peer, message.clone())?;
            }
        }
        Ok(())
    }

    async fn leave(&self) {
        self.group.crash(&self.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_views(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Vec<View> {
        let mut views = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            if let Delivery::ViewChanged(view) = delivery {
                views.push(view);
            }
        }
        views
    }

    #[tokio::test]
    async fn test_views_follow_membership() {
        let group = MemoryGroup::new("masters");
        let (a, mut rx_a) = group.join("a");
        let (_b, _rx_b) = group.join("b");

        assert_eq!(a.view().members, vec!["a", "b"]);
        let views = drain_views(&mut rx_a);
        assert_eq!(views.last().unwrap().members, vec!["a", "b"]);

        group.crash("b");
        assert_eq!(a.view().members, vec!["a"]);
    }

    #[tokio::test]
    async fn test_partition_splits_views_and_blocks_messages() {
        let group = MemoryGroup::new("masters");
        let (a, _rx_a) = group.join("a");
        let (b, _rx_b) = group.join("b");
        let (c, mut rx_c) = group.join("c");

        group.partition(&[&["a", "b"], &["c"]]);
        assert_eq!(a.view().members, vec!["a", "b"]);
        assert_eq!(c.view().coordinator(), Some("c"));

        let err = a
            .send("c", ClusterMessage::Event(lock_event()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Unreachable(_)));

        group.heal();
        assert_eq!(b.view().members, vec!["a", "b", "c"]);
        drain_views(&mut rx_c);
        a.send("c", ClusterMessage::Event(lock_event()))
            .await
            .unwrap();
        assert!(matches!(
            rx_c.try_recv(),
            Ok(Delivery::Message { ref from, .. }) if from == "a"
        ));
    }

    fn lock_event() -> devspace_core::events::BusEvent {
        devspace_core::events::BusEvent::Stopping(devspace_core::events::WorkspaceStoppingEvent {
            workspace_id: "w1".into(),
            stopped_by: None,
            reason: None,
        })
    }
}
