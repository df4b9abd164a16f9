//! Distributed executor
//!
//! Routes tasks to cluster nodes chosen by the load balancer. Every
//! dispatch carries a connect-and-execute deadline; a node that fails or
//! times out mid-execution causes the task to be re-dispatched (to any
//! eligible node) up to a configurable attempt cap, after which the task
//! fails with the retries-exhausted error carrying the last cause.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time;
use uuid::Uuid;

use super::balancer::LoadBalancer;
use super::coordinator::Coordinator;
use super::node::TaskRequirements;
use super::protocol::{self, Message, RemoteOutcome};
use super::{ClusterError, ClusterResult};
use crate::error::{TaskError, TaskResult};

/// Distributed execution configuration.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Deadline for one dispatch: connect, execute remotely, and read the
    /// response.
    pub dispatch_timeout: Duration,
    /// Dispatch attempts per task before giving up.
    pub max_dispatch_attempts: u32,
    /// Pause between dispatch attempts.
    pub retry_backoff: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(10),
            max_dispatch_attempts: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

type PendingResult = oneshot::Receiver<TaskResult<Value>>;

/// Executor that runs tasks on cluster nodes.
pub struct DistributedExecutor {
    coordinator: Arc<Coordinator>,
    balancer: Arc<LoadBalancer>,
    config: DistributedConfig,
    pending: Arc<DashMap<Uuid, PendingResult>>,
}

impl DistributedExecutor {
    /// Create an executor over a running coordinator.
    pub fn new(
        coordinator: Arc<Coordinator>,
        balancer: LoadBalancer,
        config: DistributedConfig,
    ) -> Self {
        Self {
            coordinator,
            balancer: Arc::new(balancer),
            config: DistributedConfig {
                max_dispatch_attempts: config.max_dispatch_attempts.max(1),
                ..config
            },
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Submit a task for remote execution; returns its id immediately.
    pub fn submit(
        &self,
        task_type: impl Into<String>,
        payload: Value,
        requirements: Option<TaskRequirements>,
    ) -> Uuid {
        let task_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(task_id, rx);

        let coordinator = Arc::clone(&self.coordinator);
        let balancer = Arc::clone(&self.balancer);
        let config = self.config.clone();
        let task_type = task_type.into();

        tokio::spawn(async move {
            let result = Self::drive_dispatch(
                coordinator,
                balancer,
                config,
                task_id,
                task_type,
                payload,
                requirements,
            )
            .await;
            let _ = tx.send(result);
        });

        task_id
    }

    /// Attempt dispatches until success, a handler-level failure, or the
    /// attempt cap.
    async fn drive_dispatch(
        coordinator: Arc<Coordinator>,
        balancer: Arc<LoadBalancer>,
        config: DistributedConfig,
        task_id: Uuid,
        task_type: String,
        payload: Value,
        requirements: Option<TaskRequirements>,
    ) -> TaskResult<Value> {
        let mut last_error = TaskError::NoEligibleNode;

        for attempt in 1..=config.max_dispatch_attempts {
            if attempt > 1 {
                time::sleep(config.retry_backoff).await;
            }

            let nodes = coordinator.nodes().await;
            let node_id = match balancer.select(&nodes, requirements.as_ref()) {
                Some(node_id) => node_id,
                None => {
                    last_error = TaskError::NoEligibleNode;
                    continue;
                }
            };
            let address = match coordinator.get_node(&node_id).await {
                Some(node) => node.address,
                None => {
                    last_error = TaskError::NodeFailed(node_id);
                    continue;
                }
            };

            let dispatch = Self::dispatch_once(&address, task_id, &task_type, &payload);
            match time::timeout(config.dispatch_timeout, dispatch).await {
                Ok(Ok(RemoteOutcome::Completed { output })) => return Ok(output),
                Ok(Ok(RemoteOutcome::Failed { kind, reason })) => {
                    // Handler failure is not a node failure; no re-dispatch.
                    return Err(error_from_kind(&kind, reason));
                }
                Ok(Err(err)) => {
                    log::warn!(
                        "dispatch of {} to {} failed (attempt {}): {}",
                        task_id,
                        node_id,
                        attempt,
                        err
                    );
                    last_error = TaskError::NodeFailed(node_id);
                }
                Err(_) => {
                    log::warn!(
                        "dispatch of {} to {} timed out (attempt {})",
                        task_id,
                        node_id,
                        attempt
                    );
                    last_error = TaskError::Timeout(format!("dispatch to {}", node_id));
                }
            }
        }

        Err(TaskError::AllRetriesExhausted {
            attempts: config.max_dispatch_attempts,
            last: Box::new(last_error),
        })
    }

    /// One wire exchange with one node.
    async fn dispatch_once(
        address: &str,
        task_id: Uuid,
        task_type: &str,
        payload: &Value,
    ) -> ClusterResult<RemoteOutcome> {
        let stream = TcpStream::connect(address).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = Message::TaskRequest {
            task_id,
            task_type: task_type.to_string(),
            payload: payload.clone(),
        };
        protocol::write_message(&mut write_half, &request).await?;

        match protocol::read_message(&mut reader).await? {
            Some(Message::TaskResponse {
                task_id: echoed,
                outcome,
            }) if echoed == task_id => Ok(outcome),
            Some(other) => Err(ClusterError::Protocol(format!(
                "unexpected dispatch reply: {:?}",
                other
            ))),
            None => Err(ClusterError::ConnectionClosed),
        }
    }

    /// Wait up to `timeout` for a task's terminal state. On timeout the
    /// task stays pending and can be waited on again.
    pub async fn get_result(&self, task_id: Uuid, timeout: Duration) -> TaskResult<Value> {
        let (_, mut rx) = self.pending.remove(&task_id).ok_or_else(|| {
            TaskError::TaskFailure(format!("unknown or already-collected task {}", task_id))
        })?;

        match time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::TaskFailure(format!(
                "dispatch driver for {} dropped",
                task_id
            ))),
            Err(_) => {
                // Not terminal yet: keep the task claimable.
                self.pending.insert(task_id, rx);
                Err(TaskError::Timeout(format!("task {}", task_id)))
            }
        }
    }

    /// Wait for a batch concurrently, returning per-task results in input
    /// order. `timeout` bounds the whole wait.
    pub async fn wait_for_all(
        &self,
        task_ids: &[Uuid],
        timeout: Duration,
    ) -> Vec<TaskResult<Value>> {
        futures::future::join_all(
            task_ids
                .iter()
                .map(|task_id| self.get_result(*task_id, timeout)),
        )
        .await
    }

    /// Dispatch one task per payload and collect outputs in input order.
    pub async fn map(
        &self,
        task_type: &str,
        payloads: Vec<Value>,
        requirements: Option<TaskRequirements>,
        timeout: Duration,
    ) -> TaskResult<Vec<Value>> {
        let ids: Vec<Uuid> = payloads
            .into_iter()
            .map(|payload| self.submit(task_type, payload, requirements.clone()))
            .collect();

        self.wait_for_all(&ids, timeout)
            .await
            .into_iter()
            .collect()
    }

    /// Tasks submitted but not yet collected.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Rebuild a task error from its wire `(kind, reason)` form.
fn error_from_kind(kind: &str, reason: String) -> TaskError {
    match kind {
        "timeout" => TaskError::Timeout(reason),
        "shutdown" => TaskError::Shutdown,
        "resource_exhausted" => TaskError::ResourceExhausted(reason),
        _ => TaskError::TaskFailure(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::balancer::BalanceStrategy;
    use crate::cluster::coordinator::CoordinatorConfig;
    use crate::cluster::worker::{ClusterWorker, RemoteTask, WorkerConfig};
    use async_trait::async_trait;
    use serde_json::json;

    struct Square;

    #[async_trait]
    impl RemoteTask for Square {
        fn task_type(&self) -> &str {
            "square"
        }

        async fn run(&self, payload: Value) -> TaskResult<Value> {
            let n = payload["n"].as_i64().unwrap_or(0);
            Ok(json!(n * n))
        }
    }

    struct Slow;

    #[async_trait]
    impl RemoteTask for Slow {
        fn task_type(&self) -> &str {
            "slow"
        }

        async fn run(&self, _payload: Value) -> TaskResult<Value> {
            time::sleep(Duration::from_millis(300)).await;
            Ok(json!("done"))
        }
    }

    async fn cluster_with_worker() -> (Arc<Coordinator>, Arc<ClusterWorker>, DistributedExecutor)
    {
        let coordinator = Coordinator::new(CoordinatorConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: None,
            read_timeout: Duration::from_secs(5),
        });
        let coordinator_addr = coordinator.start().await.unwrap();

        let worker = ClusterWorker::new(WorkerConfig {
            node_id: Some("worker-1".to_string()),
            bind_addr: "127.0.0.1:0".to_string(),
            coordinator_addr: coordinator_addr.to_string(),
            connect_timeout: Duration::from_secs(5),
        });
        worker.register_handler(Arc::new(Square)).await;
        worker.register_handler(Arc::new(Slow)).await;
        worker.start().await.unwrap();

        let executor = DistributedExecutor::new(
            Arc::clone(&coordinator),
            LoadBalancer::new(BalanceStrategy::LeastLoaded),
            DistributedConfig {
                dispatch_timeout: Duration::from_secs(2),
                max_dispatch_attempts: 3,
                retry_backoff: Duration::from_millis(20),
            },
        );
        (coordinator, worker, executor)
    }

    #[tokio::test]
    async fn test_submit_and_get_result() {
        let (coordinator, worker, executor) = cluster_with_worker().await;

        let id = executor.submit("square", json!({ "n": 7 }), None);
        let result = executor
            .get_result(id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result, json!(49));
        assert_eq!(executor.pending_count(), 0);

        worker.leave().await;
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_handler_failure_not_redispatched() {
        let (coordinator, worker, executor) = cluster_with_worker().await;

        let id = executor.submit("nonexistent", json!({}), None);
        let err = executor
            .get_result(id, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "task_failure");

        worker.leave().await;
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_no_nodes_exhausts_retries() {
        let coordinator = Coordinator::new(CoordinatorConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: None,
            read_timeout: Duration::from_secs(5),
        });
        coordinator.start().await.unwrap();

        let executor = DistributedExecutor::new(
            Arc::clone(&coordinator),
            LoadBalancer::new(BalanceStrategy::RoundRobin),
            DistributedConfig {
                dispatch_timeout: Duration::from_millis(200),
                max_dispatch_attempts: 2,
                retry_backoff: Duration::from_millis(10),
            },
        );

        let id = executor.submit("square", json!({ "n": 1 }), None);
        let err = executor
            .get_result(id, Duration::from_secs(2))
            .await
            .unwrap_err();

        match err {
            TaskError::AllRetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert_eq!(last.kind(), "no_eligible_node");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_get_result_timeout_keeps_task_pending() {
        let (coordinator, worker, executor) = cluster_with_worker().await;

        let id = executor.submit("slow", json!({}), None);
        let err = executor
            .get_result(id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");

        // A second, longer wait still reaches the result.
        let result = executor
            .get_result(id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result, json!("done"));

        worker.leave().await;
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_map_collects_in_order() {
        let (coordinator, worker, executor) = cluster_with_worker().await;

        let payloads: Vec<Value> = (1..=5).map(|n| json!({ "n": n })).collect();
        let results = executor
            .map("square", payloads, None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(results, vec![json!(1), json!(4), json!(9), json!(16), json!(25)]);

        worker.leave().await;
        coordinator.shutdown();
    }
}
