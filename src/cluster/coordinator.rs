//! Cluster coordinator
//!
//! The single owner of membership state. Runs a TCP server handling
//! JSON-line join, heartbeat, and leave messages, with every connection
//! served on its own task. A background detector marks nodes Failed once
//! they exceed the heartbeat timeout (default three missed intervals) and
//! publishes the failure so pending work can be re-dispatched.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time;

use super::node::{NodeId, NodeInfo, NodeRole, NodeStatus};
use super::protocol::{self, Message};
use super::{ClusterError, ClusterResult};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address the membership server binds to.
    pub bind_addr: String,
    /// Interval workers are told to heartbeat at.
    pub heartbeat_interval: Duration,
    /// Silence span after which a node is Failed. `None` selects three
    /// heartbeat intervals.
    pub heartbeat_timeout: Option<Duration>,
    /// Per-read deadline on member connections.
    pub read_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7400".to_string(),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: None,
            read_timeout: Duration::from_secs(10),
        }
    }
}

impl CoordinatorConfig {
    /// The effective failure-detection timeout.
    pub fn effective_timeout(&self) -> Duration {
        self.heartbeat_timeout
            .unwrap_or(self.heartbeat_interval * 3)
    }
}

/// Membership coordinator. Exactly one per cluster.
pub struct Coordinator {
    config: CoordinatorConfig,
    nodes: Arc<RwLock<HashMap<NodeId, NodeInfo>>>,
    failure_tx: mpsc::UnboundedSender<NodeId>,
    failure_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeId>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Coordinator {
    /// Create a coordinator with the given configuration.
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            nodes: Arc::new(RwLock::new(HashMap::new())),
            failure_tx,
            failure_rx: Mutex::new(Some(failure_rx)),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Bind the server, start the accept loop and failure detector, and
    /// return the bound address.
    pub async fn start(self: &Arc<Self>) -> ClusterResult<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);

        let coordinator = Arc::clone(self);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        log::debug!("accepted cluster connection from {}", peer);
                        let coordinator = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            if let Err(err) = coordinator.handle_connection(stream).await {
                                log::debug!("cluster connection from {} ended: {}", peer, err);
                            }
                        });
                    }
                    Err(err) => {
                        log::error!("accept error: {}", err);
                    }
                }
            }
        });

        let coordinator = Arc::clone(self);
        let detector_task = tokio::spawn(async move {
            coordinator.run_failure_detector().await;
        });

        let mut tasks = self.tasks.lock();
        tasks.push(accept_task);
        tasks.push(detector_task);

        log::info!("coordinator listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Receiver of node-failure events. Can be taken once.
    pub fn take_failure_events(&self) -> Option<mpsc::UnboundedReceiver<NodeId>> {
        self.failure_rx.lock().take()
    }

    /// Serve one member connection until it closes or times out.
    async fn handle_connection(&self, stream: TcpStream) -> ClusterResult<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            let message = match time::timeout(
                self.config.read_timeout,
                protocol::read_message(&mut reader),
            )
            .await
            {
                Ok(result) => match result? {
                    Some(message) => message,
                    None => return Ok(()),
                },
                Err(_) => {
                    return Err(ClusterError::Timeout("member connection read".into()));
                }
            };

            match message {
                Message::JoinRequest {
                    node_id,
                    address,
                    capabilities,
                } => {
                    let peers = self.admit(node_id.clone(), address, capabilities).await;
                    let response = Message::JoinResponse {
                        accepted: true,
                        assigned_role: NodeRole::Worker,
                        peers,
                        heartbeat_interval_ms: self.config.heartbeat_interval.as_millis() as u64,
                    };
                    protocol::write_message(&mut write_half, &response).await?;
                }
                Message::Heartbeat { node_id, load, .. } => {
                    self.record_heartbeat(&node_id, load).await;
                    let ack = Message::HeartbeatAck {
                        timestamp: protocol::now_millis(),
                    };
                    protocol::write_message(&mut write_half, &ack).await?;
                }
                Message::LeaveNotice { node_id } => {
                    self.remove_node(&node_id).await;
                    let ack = Message::HeartbeatAck {
                        timestamp: protocol::now_millis(),
                    };
                    protocol::write_message(&mut write_half, &ack).await?;
                }
                other => {
                    return Err(ClusterError::Protocol(format!(
                        "unexpected message on membership connection: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Register (or refresh) a member and return the peer list.
    async fn admit(
        &self,
        node_id: NodeId,
        address: String,
        capabilities: super::node::NodeCapabilities,
    ) -> Vec<NodeInfo> {
        let mut nodes = self.nodes.write().await;
        nodes.insert(
            node_id.clone(),
            NodeInfo::new(node_id.clone(), address, capabilities),
        );
        log::info!("node {} joined, cluster size {}", node_id, nodes.len());
        nodes.values().cloned().collect()
    }

    async fn record_heartbeat(&self, node_id: &NodeId, load: f64) {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(node_id) {
            Some(node) => node.record_heartbeat(load),
            None => {
                log::warn!("heartbeat from unknown node {}", node_id);
            }
        }
    }

    /// Drop a member after a leave notice.
    pub async fn remove_node(&self, node_id: &NodeId) {
        if self.nodes.write().await.remove(node_id).is_some() {
            log::info!("node {} left the cluster", node_id);
        }
    }

    /// Periodically fail nodes whose heartbeats went silent.
    async fn run_failure_detector(&self) {
        let timeout = self.config.effective_timeout();
        let mut ticker = time::interval(self.config.heartbeat_interval);

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let mut newly_failed = Vec::new();
            {
                let mut nodes = self.nodes.write().await;
                for node in nodes.values_mut() {
                    if node.status != NodeStatus::Failed && node.heartbeat_expired(timeout) {
                        node.status = NodeStatus::Failed;
                        newly_failed.push(node.id.clone());
                    }
                }
            }

            for node_id in newly_failed {
                log::warn!("node {} failed heartbeat check", node_id);
                let _ = self.failure_tx.send(node_id);
            }
        }
    }

    /// Snapshot of every member.
    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Snapshot of members currently accepting work.
    pub async fn active_nodes(&self) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .cloned()
            .collect()
    }

    /// One member by id.
    pub async fn get_node(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Current member count.
    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Stop serving and cancel background tasks.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        log::info!("coordinator shut down");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeCapabilities;
    use tokio::io::BufReader as TokioBufReader;

    fn test_config(heartbeat_ms: u64) -> CoordinatorConfig {
        CoordinatorConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            heartbeat_timeout: None,
            read_timeout: Duration::from_secs(10),
        }
    }

    async fn join(
        addr: SocketAddr,
        node_id: &str,
    ) -> (
        TokioBufReader<tokio::net::tcp::OwnedReadHalf>,
        tokio::net::tcp::OwnedWriteHalf,
        Message,
    ) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = TokioBufReader::new(read_half);

        let request = Message::JoinRequest {
            node_id: node_id.to_string(),
            address: "127.0.0.1:7999".to_string(),
            capabilities: NodeCapabilities::minimal(4, 8.0),
        };
        protocol::write_message(&mut write_half, &request)
            .await
            .unwrap();
        let response = protocol::read_message(&mut reader).await.unwrap().unwrap();
        (reader, write_half, response)
    }

    #[tokio::test]
    async fn test_join_registers_node() {
        let coordinator = Coordinator::new(test_config(500));
        let addr = coordinator.start().await.unwrap();

        let (_reader, _writer, response) = join(addr, "node-1").await;
        match response {
            Message::JoinResponse {
                accepted,
                assigned_role,
                peers,
                heartbeat_interval_ms,
            } => {
                assert!(accepted);
                assert_eq!(assigned_role, NodeRole::Worker);
                assert_eq!(peers.len(), 1);
                assert_eq!(heartbeat_interval_ms, 500);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        assert_eq!(coordinator.node_count().await, 1);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_heartbeat_updates_load_and_status() {
        let coordinator = Coordinator::new(test_config(500));
        let addr = coordinator.start().await.unwrap();
        let (mut reader, mut writer, _) = join(addr, "node-1").await;

        let heartbeat = Message::Heartbeat {
            node_id: "node-1".to_string(),
            load: 1.4,
            timestamp: protocol::now_millis(),
        };
        protocol::write_message(&mut writer, &heartbeat)
            .await
            .unwrap();
        let ack = protocol::read_message(&mut reader).await.unwrap().unwrap();
        assert!(matches!(ack, Message::HeartbeatAck { .. }));

        let node = coordinator.get_node(&"node-1".to_string()).await.unwrap();
        assert!((node.load - 1.4).abs() < 1e-9);
        assert_eq!(node.status, NodeStatus::Degraded);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_leave_removes_node() {
        let coordinator = Coordinator::new(test_config(500));
        let addr = coordinator.start().await.unwrap();
        let (mut reader, mut writer, _) = join(addr, "node-1").await;

        let leave = Message::LeaveNotice {
            node_id: "node-1".to_string(),
        };
        protocol::write_message(&mut writer, &leave).await.unwrap();
        let _ack = protocol::read_message(&mut reader).await.unwrap().unwrap();

        assert_eq!(coordinator.node_count().await, 0);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_failure_detector_marks_silent_nodes() {
        let coordinator = Coordinator::new(test_config(30));
        let addr = coordinator.start().await.unwrap();
        let mut failures = coordinator.take_failure_events().unwrap();

        let (_reader, _writer, _) = join(addr, "node-1").await;

        // No heartbeats: after 3 intervals the node must be Failed.
        let failed_id = time::timeout(Duration::from_secs(2), failures.recv())
            .await
            .expect("failure event within deadline")
            .unwrap();
        assert_eq!(failed_id, "node-1");

        let node = coordinator.get_node(&"node-1".to_string()).await.unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert!(coordinator.active_nodes().await.is_empty());
        coordinator.shutdown();
    }
}
