//! Cluster wire protocol
//!
//! Line-delimited JSON over TCP: every message is one JSON object with a
//! `type` tag followed by a newline. Payloads for remote tasks travel as
//! JSON values alongside a registered task-type name; closures never cross
//! the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use uuid::Uuid;

use super::node::{NodeCapabilities, NodeId, NodeInfo, NodeRole};
use super::ClusterError;

/// Outcome of a remotely executed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum RemoteOutcome {
    /// The handler returned a value.
    Completed {
        /// Handler output.
        output: Value,
    },
    /// The handler failed or was missing.
    Failed {
        /// Error kind name, per the crate error taxonomy.
        kind: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Every message that crosses the cluster wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// A node asking to join the cluster.
    JoinRequest {
        /// Joining node's id.
        node_id: NodeId,
        /// `host:port` the node serves task dispatches on.
        address: String,
        /// Advertised hardware.
        capabilities: NodeCapabilities,
    },
    /// Coordinator's answer to a join.
    JoinResponse {
        /// Whether the node was admitted.
        accepted: bool,
        /// Role assigned to the joiner.
        assigned_role: NodeRole,
        /// Current peer list.
        peers: Vec<NodeInfo>,
        /// Interval the worker must heartbeat at, in milliseconds.
        heartbeat_interval_ms: u64,
    },
    /// Periodic liveness report from a worker.
    Heartbeat {
        /// Reporting node.
        node_id: NodeId,
        /// Current load, 0.0..1.0 and beyond when over-committed.
        load: f64,
        /// Sender's wall clock, milliseconds since the epoch.
        timestamp: i64,
    },
    /// Acknowledgement for heartbeats and leaves.
    HeartbeatAck {
        /// Receiver's wall clock, milliseconds since the epoch.
        timestamp: i64,
    },
    /// Graceful departure notice.
    LeaveNotice {
        /// Departing node.
        node_id: NodeId,
    },
    /// Task dispatched to a worker.
    TaskRequest {
        /// Dispatch id, echoed in the response.
        task_id: Uuid,
        /// Registered handler name on the worker.
        task_type: String,
        /// Serialized handler arguments.
        payload: Value,
    },
    /// Worker's answer to a dispatch.
    TaskResponse {
        /// Dispatch id this answers.
        task_id: Uuid,
        /// What happened.
        outcome: RemoteOutcome,
    },
}

/// Write one message as a JSON line.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ClusterError>
where
    W: AsyncWriteExt + Unpin,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON-line message. `None` means the peer closed the
/// connection cleanly.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ClusterError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line.trim_end())?;
    Ok(Some(message))
}

/// Current wall clock in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let message = Message::JoinRequest {
            node_id: "node-1".into(),
            address: "127.0.0.1:7001".into(),
            capabilities: NodeCapabilities {
                cpu_cores: 8,
                memory_gb: 16.0,
                gpus: 1,
                features: HashSet::from(["avx2".to_string()]),
            },
        };
        write_message(&mut client_write, &message).await.unwrap();

        let mut reader = BufReader::new(server_read);
        let received = read_message(&mut reader).await.unwrap().unwrap();
        match received {
            Message::JoinRequest {
                node_id,
                address,
                capabilities,
            } => {
                assert_eq!(node_id, "node-1");
                assert_eq!(address, "127.0.0.1:7001");
                assert_eq!(capabilities.cpu_cores, 8);
                assert!(capabilities.features.contains("avx2"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_reads_as_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut reader = BufReader::new(server);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn test_wire_format_is_tagged_json() {
        let message = Message::Heartbeat {
            node_id: "node-2".into(),
            load: 0.25,
            timestamp: 1234,
        };
        let encoded = serde_json::to_string(&message).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "Heartbeat");
        assert_eq!(value["node_id"], "node-2");
        assert_eq!(value["load"], 0.25);
    }

    #[test]
    fn test_remote_outcome_tagging() {
        let outcome = RemoteOutcome::Failed {
            kind: "task_failure".into(),
            reason: "handler blew up".into(),
        };
        let encoded = serde_json::to_value(&outcome).unwrap();
        assert_eq!(encoded["status"], "Failed");
        assert_eq!(encoded["kind"], "task_failure");
    }
}
