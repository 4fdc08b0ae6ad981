// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static-membership group over TCP.
//!
//! Members are listed in a discovery file. Each node listens on its own address, sends
//! heartbeats to every other member and derives its [`View`] from which peers it heard from
//! within the failure timeout. Frames are newline-delimited JSON.
//!
//! Every peer has its own outbound connection slot, and writes are bounded by
//! [`TcpGroupConfig::write_timeout`], so a peer that stops reading only delays traffic to
//! itself.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ClusterError, ClusterMessage, Delivery, GroupTransport, NodeId, Result, View};

/// One entry of the discovery file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMember {
    /// Node id.
    pub id: NodeId,
    /// `host:port` the node listens on.
    pub addr: String,
}

/// Static list of master nodes.
///
/// ```json
/// { "members": [ { "id": "master-1", "addr": "10.0.0.1:7800" } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// All members, including this node.
    pub members: Vec<DiscoveryMember>,
}

impl DiscoveryConfig {
    /// Read a discovery file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        if config.members.is_empty() {
            return Err(ClusterError::Config(format!(
                "{} lists no members",
                path.as_ref().display()
            )));
        }
        Ok(config)
    }

    fn addr_of(&self, node: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.id == node)
            .map(|m| m.addr.as_str())
    }
}

/// Failure detection timing.
#[derive(Debug, Clone)]
pub struct TcpGroupConfig {
    /// How often heartbeats are sent.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer leaves the view.
    pub failure_timeout: Duration,
    /// Bound on a single frame write; the connection is dropped when it elapses.
    pub write_timeout: Duration,
}

impl Default for TcpGroupConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
enum Body {
    Heartbeat,
    Message(ClusterMessage),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    group: String,
    from: NodeId,
    body: Body,
}

struct Shared {
    node: NodeId,
    group: String,
    peers: BTreeMap<NodeId, String>,
    config: TcpGroupConfig,
    last_seen: Mutex<HashMap<NodeId, Instant>>,
    view: Mutex<View>,
    view_seq: AtomicU64,
    connections: HashMap<NodeId, Arc<tokio::sync::Mutex<Option<TcpStream>>>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    left: AtomicBool,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn frame(&self, body: Body) -> Result<Vec<u8>> {
        let envelope = Envelope {
            group: self.group.clone(),
            from: self.node.clone(),
            body,
        };
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        Ok(line)
    }

    async fn write_to(&self, to: &str, frame: &[u8]) -> Result<()> {
        let (Some(addr), Some(slot)) = (self.peers.get(to), self.connections.get(to)) else {
            return Err(ClusterError::Unreachable(to.to_string()));
        };
        let mut connection = slot.lock().await;
        if connection.is_none() {
            let stream = tokio::time::timeout(
                self.config.heartbeat_interval,
                TcpStream::connect(addr.as_str()),
            )
            .await
            .ok()
            .and_then(|r| r.ok())
            .ok_or_else(|| ClusterError::Unreachable(to.to_string()))?;
            stream.set_nodelay(true)?;
            *connection = Some(stream);
        }
        let Some(stream) = connection.as_mut() else {
            return Err(ClusterError::Unreachable(to.to_string()));
        };
        let written = tokio::time::timeout(self.config.write_timeout, stream.write_all(frame)).await;
        let error = match written {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write timed out after {:?}", self.config.write_timeout),
        };
        *connection = None;
        debug!(node_id = %self.node, peer = %to, error = %error, "Dropped connection");
        Err(ClusterError::Unreachable(to.to_string()))
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = guard(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn seen(&self, from: &str) {
        guard(&self.last_seen).insert(from.to_string(), Instant::now());
    }

    /// Recompute the view from heartbeat freshness.
    fn refresh_view(&self) {
        let now = Instant::now();
        let mut members = vec![self.node.clone()];
        {
            let last_seen = guard(&self.last_seen);
            members.extend(
                last_seen
                    .iter()
                    .filter(|(_, at)| now.duration_since(**at) <= self.config.failure_timeout)
                    .map(|(node, _)| node.clone()),
            );
        }
        let mut candidate = View::new(0, members);
        let mut view = guard(&self.view);
        if view.members == candidate.members {
            return;
        }
        candidate.id = self.view_seq.fetch_add(1, Ordering::SeqCst) + 1;
        *view = candidate.clone();
        drop(view);
        info!(
            node_id = %self.node,
            view_id = candidate.id,
            members = ?candidate.members,
            "Cluster view changed"
        );
        let _ = self.deliveries.send(Delivery::ViewChanged(candidate));
    }

    async fn read_connection(self: Arc<Self>, stream: TcpStream) {
        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(node_id = %self.node, error = %e, "Connection read failed");
                    break;
                }
            };
            let envelope: Envelope = match serde_json::from_str(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(node_id = %self.node, error = %e, "Discarding malformed frame");
                    continue;
                }
            };
            if envelope.group != self.group || !self.peers.contains_key(&envelope.from) {
                continue;
            }
            let known = guard(&self.last_seen).contains_key(&envelope.from);
            self.seen(&envelope.from);
            if !known {
                self.refresh_view();
            }
            if let Body::Message(message) = envelope.body {
                let _ = self.deliveries.send(Delivery::Message {
                    from: envelope.from,
                    message,
                });
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(node_id = %self.node, peer = %peer, "Accepted connection");
                    let reader = tokio::spawn(self.clone().read_connection(stream));
                    self.track(reader);
                }
                Err(e) => {
                    warn!(node_id = %self.node, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            if let Ok(frame) = self.frame(Body::Heartbeat) {
                for peer in self.peers.keys() {
                    let _ = self.write_to(peer, &frame).await;
                }
            }
            self.refresh_view();
        }
    }
}

/// Factory for TCP group members.
pub struct TcpGroup;

impl TcpGroup {
    /// Bind this node's address and start heartbeating to the other members.
    pub async fn join(
        group_name: impl Into<String>,
        node_id: impl Into<NodeId>,
        discovery: &DiscoveryConfig,
        config: TcpGroupConfig,
    ) -> Result<(Arc<dyn GroupTransport>, mpsc::UnboundedReceiver<Delivery>)> {
        let (transport, rx) = Self::start(group_name, node_id, discovery, config).await?;
        Ok((transport as Arc<dyn GroupTransport>, rx))
    }

    async fn start(
        group_name: impl Into<String>,
        node_id: impl Into<NodeId>,
        discovery: &DiscoveryConfig,
        config: TcpGroupConfig,
    ) -> Result<(Arc<TcpTransport>, mpsc::UnboundedReceiver<Delivery>)> {
        let node = node_id.into();
        let group = group_name.into();
        let own_addr = discovery.addr_of(&node).ok_or_else(|| {
            ClusterError::Config(format!("node '{node}' is not listed in discovery"))
        })?;
        let listener = TcpListener::bind(own_addr).await?;
        let peers: BTreeMap<NodeId, String> = discovery
            .members
            .iter()
            .filter(|m| m.id != node)
            .map(|m| (m.id.clone(), m.addr.clone()))
            .collect();
        let connections = peers
            .keys()
            .map(|peer| (peer.clone(), Arc::default()))
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let initial = View::new(1, vec![node.clone()]);
        let shared = Arc::new(Shared {
            node: node.clone(),
            group: group.clone(),
            peers,
            config,
            last_seen: Mutex::new(HashMap::new()),
            view: Mutex::new(initial.clone()),
            view_seq: AtomicU64::new(1),
            connections,
            deliveries: tx,
            tasks: Mutex::new(Vec::new()),
            left: AtomicBool::new(false),
        });
        let _ = shared.deliveries.send(Delivery::ViewChanged(initial));

        let accept = tokio::spawn(shared.clone().accept_loop(listener));
        let heartbeat = tokio::spawn(shared.clone().heartbeat_loop());
        guard(&shared.tasks).extend([accept, heartbeat]);

        info!(node_id = %node, group = %group, addr = %own_addr, "TCP group member started");
        Ok((Arc::new(TcpTransport { shared }), rx))
    }
}

struct TcpTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl GroupTransport for TcpTransport {
    fn local_node(&self) -> &str {
        &self.shared.node
    }

    fn group_name(&self) -> &str {
        &self.shared.group
    }

    fn view(&self) -> View {
        guard(&self.shared.view).clone()
    }

    async fn send(&self, to: &str, message: ClusterMessage) -> Result<()> {
        if self.shared.left.load(Ordering::SeqCst) {
            return Err(ClusterError::NotMember(self.shared.group.clone()));
        }
        if !self.view().contains(to) {
            return Err(ClusterError::Unreachable(to.to_string()));
        }
        let frame = self.shared.frame(Body::Message(message))?;
        self.shared.write_to(to, &frame).await
    }

    async fn broadcast(&self, message: ClusterMessage) -> Result<()> {
        if self.shared.left.load(Ordering::SeqCst) {
            return Err(ClusterError::NotMember(self.shared.group.clone()));
        }
        let frame = self.shared.frame(Body::Message(message))?;
        let mut result = Ok(());
        for peer in self.view().members {
            if peer == self.shared.node {
                continue;
            }
            if let Err(e) = self.shared.write_to(&peer, &frame).await {
                result = Err(e);
            }
        }
        result
    }

    async fn leave(&self) {
        self.shared.left.store(true, Ordering::SeqCst);
        for task in guard(&self.shared.tasks).drain(..) {
            task.abort();
        }
        for slot in self.shared.connections.values() {
            *slot.lock().await = None;
        }
        info!(node_id = %self.shared.node, "TCP group member stopped");
    }
}
