//! Cluster worker role
//!
//! A worker joins a coordinator, heartbeats at the interval it was
//! assigned, and serves task dispatches on its own TCP listener. Task
//! execution is routed through a registry of [`RemoteTask`] handlers keyed
//! by task-type name; the wire carries `(task_type, payload)` rather than
//! code.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use super::node::{NodeCapabilities, NodeId};
use super::protocol::{self, Message, RemoteOutcome};
use super::{ClusterError, ClusterResult};
use crate::error::TaskResult;

/// Handler for one remotely dispatchable task type.
#[async_trait]
pub trait RemoteTask: Send + Sync {
    /// Name this handler is registered under.
    fn task_type(&self) -> &str;

    /// Execute the task against its JSON payload.
    async fn run(&self, payload: Value) -> TaskResult<Value>;
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Node id; a random one is generated when absent.
    pub node_id: Option<NodeId>,
    /// Address the task server binds to.
    pub bind_addr: String,
    /// Coordinator membership address.
    pub coordinator_addr: String,
    /// Deadline for connects and handshake reads.
    pub connect_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            bind_addr: "127.0.0.1:0".to_string(),
            coordinator_addr: "127.0.0.1:7400".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A cluster member that executes dispatched tasks.
pub struct ClusterWorker {
    node_id: NodeId,
    config: WorkerConfig,
    capabilities: NodeCapabilities,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn RemoteTask>>>>,
    active_tasks: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ClusterWorker {
    /// Create a worker that will join the coordinator in `config`.
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));
        Arc::new(Self {
            node_id,
            config,
            capabilities: NodeCapabilities::detect(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            active_tasks: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        })
    }

    /// This worker's node id.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Address of the task server, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Tasks currently executing.
    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Register a task handler under its type name.
    pub async fn register_handler(&self, handler: Arc<dyn RemoteTask>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(handler.task_type().to_string(), handler);
    }

    /// Bind the task server, join the coordinator, and start
    /// heartbeating. Returns the task-server address.
    pub async fn start(self: &Arc<Self>) -> ClusterResult<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);

        let heartbeat_interval = self.join_cluster(local_addr).await?;

        let worker = Arc::clone(self);
        let server_task = tokio::spawn(async move {
            worker.serve_tasks(listener).await;
        });

        let worker = Arc::clone(self);
        let heartbeat_task = tokio::spawn(async move {
            worker.heartbeat_loop(heartbeat_interval).await;
        });

        let mut tasks = self.tasks.lock();
        tasks.push(server_task);
        tasks.push(heartbeat_task);

        log::info!(
            "worker {} serving tasks on {} (heartbeat every {:?})",
            self.node_id,
            local_addr,
            heartbeat_interval
        );
        Ok(local_addr)
    }

    /// Perform the join handshake; returns the assigned heartbeat
    /// interval.
    async fn join_cluster(&self, task_addr: SocketAddr) -> ClusterResult<Duration> {
        let stream = time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.coordinator_addr),
        )
        .await
        .map_err(|_| ClusterError::Timeout("coordinator connect".into()))??;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = Message::JoinRequest {
            node_id: self.node_id.clone(),
            address: task_addr.to_string(),
            capabilities: self.capabilities.clone(),
        };
        protocol::write_message(&mut write_half, &request).await?;

        let response = time::timeout(
            self.config.connect_timeout,
            protocol::read_message(&mut reader),
        )
        .await
        .map_err(|_| ClusterError::Timeout("join response".into()))??
        .ok_or(ClusterError::ConnectionClosed)?;

        match response {
            Message::JoinResponse {
                accepted: true,
                heartbeat_interval_ms,
                peers,
                ..
            } => {
                log::info!(
                    "worker {} joined cluster with {} peers",
                    self.node_id,
                    peers.len()
                );
                Ok(Duration::from_millis(heartbeat_interval_ms.max(1)))
            }
            Message::JoinResponse { accepted: false, .. } => Err(ClusterError::JoinRejected(
                "coordinator refused the join".into(),
            )),
            other => Err(ClusterError::Protocol(format!(
                "unexpected join response: {:?}",
                other
            ))),
        }
    }

    /// Report load to the coordinator once per interval. Transient send
    /// failures are logged and skipped; the coordinator's failure detector
    /// handles prolonged silence.
    async fn heartbeat_loop(&self, interval: Duration) {
        let mut ticker = time::interval(interval);
        ticker.tick().await;

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(err) = self.send_heartbeat().await {
                log::debug!("heartbeat from {} failed: {}", self.node_id, err);
            }
        }
    }

    async fn send_heartbeat(&self) -> ClusterResult<()> {
        let stream = time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.coordinator_addr),
        )
        .await
        .map_err(|_| ClusterError::Timeout("coordinator connect".into()))??;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let load = self.active_tasks.load(Ordering::SeqCst) as f64
            / self.capabilities.cpu_cores.max(1) as f64;
        let heartbeat = Message::Heartbeat {
            node_id: self.node_id.clone(),
            load,
            timestamp: protocol::now_millis(),
        };
        protocol::write_message(&mut write_half, &heartbeat).await?;

        let ack = time::timeout(
            self.config.connect_timeout,
            protocol::read_message(&mut reader),
        )
        .await
        .map_err(|_| ClusterError::Timeout("heartbeat ack".into()))??;

        match ack {
            Some(Message::HeartbeatAck { .. }) => Ok(()),
            Some(other) => Err(ClusterError::Protocol(format!(
                "unexpected heartbeat reply: {:?}",
                other
            ))),
            None => Err(ClusterError::ConnectionClosed),
        }
    }

    /// Accept dispatch connections, one task per connection.
    async fn serve_tasks(self: &Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let worker = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = worker.handle_dispatch(stream).await {
                            log::debug!("dispatch connection ended: {}", err);
                        }
                    });
                }
                Err(err) => {
                    log::error!("task server accept error: {}", err);
                }
            }
        }
    }

    async fn handle_dispatch(&self, stream: TcpStream) -> ClusterResult<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let message = time::timeout(
            self.config.connect_timeout,
            protocol::read_message(&mut reader),
        )
        .await
        .map_err(|_| ClusterError::Timeout("dispatch read".into()))??;

        let (task_id, task_type, payload) = match message {
            Some(Message::TaskRequest {
                task_id,
                task_type,
                payload,
            }) => (task_id, task_type, payload),
            Some(other) => {
                return Err(ClusterError::Protocol(format!(
                    "unexpected message on dispatch connection: {:?}",
                    other
                )));
            }
            None => return Ok(()),
        };

        let outcome = self.execute_task(&task_type, payload).await;
        let response = Message::TaskResponse { task_id, outcome };
        protocol::write_message(&mut write_half, &response).await
    }

    async fn execute_task(&self, task_type: &str, payload: Value) -> RemoteOutcome {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(task_type).cloned()
        };

        let handler = match handler {
            Some(handler) => handler,
            None => {
                return RemoteOutcome::Failed {
                    kind: "task_failure".into(),
                    reason: format!("no handler registered for task type {}", task_type),
                };
            }
        };

        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        let result = handler.run(payload).await;
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(output) => RemoteOutcome::Completed { output },
            Err(err) => RemoteOutcome::Failed {
                kind: err.kind().into(),
                reason: err.to_string(),
            },
        }
    }

    /// Notify the coordinator and stop serving. Idempotent.
    pub async fn leave(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Ok(Ok(stream)) = time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.coordinator_addr),
        )
        .await
        {
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let notice = Message::LeaveNotice {
                node_id: self.node_id.clone(),
            };
            if protocol::write_message(&mut write_half, &notice).await.is_ok() {
                let _ = time::timeout(
                    self.config.connect_timeout,
                    protocol::read_message(&mut reader),
                )
                .await;
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        log::info!("worker {} left the cluster", self.node_id);
    }
}
