//! Cluster node model and hardware capability detection
//!
//! A node advertises its hardware (cores, memory, GPUs, CPU features) when
//! joining and reports a load figure with every heartbeat. Detection is
//! best-effort: a probe that fails simply reports the capability as
//! absent.

use std::collections::HashSet;
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::default_parallelism;

/// Cluster-wide node identifier.
pub type NodeId = String;

/// Role assigned to a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Owns membership state and routes joins. Exactly one per cluster.
    Coordinator,
    /// Executes dispatched tasks.
    Worker,
}

/// Liveness status of a node as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Heartbeating and accepting work.
    Active,
    /// Heartbeating but over-committed (load above 1.0).
    Degraded,
    /// Missed heartbeats beyond the timeout.
    Failed,
}

/// Hardware advertised by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Logical CPU cores.
    pub cpu_cores: usize,
    /// Physical memory in gigabytes.
    pub memory_gb: f64,
    /// Discrete GPUs (NVIDIA + AMD) plus render devices.
    pub gpus: usize,
    /// CPU feature flags such as `avx`, `avx2`, `sse4.1`.
    pub features: HashSet<String>,
}

impl NodeCapabilities {
    /// Probe the local hardware. Every probe failure degrades to "absent"
    /// rather than erroring.
    pub fn detect() -> Self {
        let gpus = detect_nvidia_gpus() + detect_amd_gpus() + detect_render_devices();
        Self {
            cpu_cores: default_parallelism(),
            memory_gb: detect_memory_gb(),
            gpus,
            features: detect_cpu_features(),
        }
    }

    /// Minimal capabilities for tests and headless deployments.
    pub fn minimal(cpu_cores: usize, memory_gb: f64) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            gpus: 0,
            features: HashSet::new(),
        }
    }
}

/// Requirements a task can place on node selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    /// Minimum logical cores.
    pub min_cpu_cores: usize,
    /// Minimum memory in gigabytes.
    pub min_memory_gb: f64,
    /// Features the node must advertise.
    pub required_features: HashSet<String>,
}

/// A member of the cluster as tracked by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node id.
    pub id: NodeId,
    /// `host:port` the node accepts task dispatches on.
    pub address: String,
    /// Advertised hardware.
    pub capabilities: NodeCapabilities,
    /// Last reported load; above 1.0 means over-committed.
    pub load: f64,
    /// When the last heartbeat arrived.
    pub last_heartbeat: DateTime<Utc>,
    /// Liveness status.
    pub status: NodeStatus,
}

impl NodeInfo {
    /// Create a freshly joined, unloaded node record.
    pub fn new(id: NodeId, address: String, capabilities: NodeCapabilities) -> Self {
        Self {
            id,
            address,
            capabilities,
            load: 0.0,
            last_heartbeat: Utc::now(),
            status: NodeStatus::Active,
        }
    }

    /// Apply a heartbeat: refresh the timestamp and derive status from
    /// the reported load.
    pub fn record_heartbeat(&mut self, load: f64) {
        self.load = load;
        self.last_heartbeat = Utc::now();
        self.status = if load > 1.0 {
            NodeStatus::Degraded
        } else {
            NodeStatus::Active
        };
    }

    /// Whether the node has gone `timeout` without a heartbeat.
    pub fn heartbeat_expired(&self, timeout: Duration) -> bool {
        let elapsed = Utc::now() - self.last_heartbeat;
        elapsed.num_milliseconds().max(0) as u128 > timeout.as_millis()
    }

    /// Whether this node satisfies the given task requirements.
    pub fn meets(&self, requirements: &TaskRequirements) -> bool {
        self.capabilities.cpu_cores >= requirements.min_cpu_cores
            && self.capabilities.memory_gb >= requirements.min_memory_gb
            && requirements
                .required_features
                .iter()
                .all(|f| self.capabilities.features.contains(f))
    }
}

/// Count NVIDIA GPUs via the `nvidia-smi` listing.
fn detect_nvidia_gpus() -> usize {
    Command::new("nvidia-smi")
        .arg("-L")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| {
            String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter(|line| line.starts_with("GPU "))
                .count()
        })
        .unwrap_or(0)
}

/// Count AMD GPUs via the `rocm-smi` id listing.
fn detect_amd_gpus() -> usize {
    Command::new("rocm-smi")
        .arg("--showid")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| {
            String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter(|line| line.contains("GPU["))
                .count()
        })
        .unwrap_or(0)
}

/// Count OpenCL-capable render devices under the well-known device path.
fn detect_render_devices() -> usize {
    std::fs::read_dir("/dev/dri")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("renderD"))
                .count()
        })
        .unwrap_or(0)
}

/// Total physical memory in gigabytes, from the platform's meminfo.
fn detect_memory_gb() -> f64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|contents| {
            contents.lines().find_map(|line| {
                let rest = line.strip_prefix("MemTotal:")?;
                let kb: f64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                Some(kb / (1024.0 * 1024.0))
            })
        })
        .unwrap_or(0.0)
}

/// Runtime-detected SIMD feature flags.
fn detect_cpu_features() -> HashSet<String> {
    let mut features = HashSet::new();

    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx") {
            features.insert("avx".to_string());
        }
        if std::arch::is_x86_feature_detected!("avx2") {
            features.insert("avx2".to_string());
        }
        if std::arch::is_x86_feature_detected!("sse4.1") {
            features.insert("sse4.1".to_string());
        }
    }

    features
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_non_fatal() {
        // Whatever the host looks like, detection must succeed.
        let caps = NodeCapabilities::detect();
        assert!(caps.cpu_cores >= 1);
        assert!(caps.memory_gb >= 0.0);
    }

    #[test]
    fn test_heartbeat_drives_status() {
        let mut node = NodeInfo::new(
            "node-1".into(),
            "127.0.0.1:9000".into(),
            NodeCapabilities::minimal(4, 8.0),
        );
        assert_eq!(node.status, NodeStatus::Active);

        node.record_heartbeat(1.5);
        assert_eq!(node.status, NodeStatus::Degraded);

        node.record_heartbeat(0.3);
        assert_eq!(node.status, NodeStatus::Active);
        assert!((node.load - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_heartbeat_expiry() {
        let node = NodeInfo::new(
            "node-1".into(),
            "127.0.0.1:9000".into(),
            NodeCapabilities::minimal(4, 8.0),
        );
        assert!(!node.heartbeat_expired(Duration::from_secs(10)));
        assert!(node.heartbeat_expired(Duration::from_millis(0)));
    }

    #[test]
    fn test_requirements_matching() {
        let mut caps = NodeCapabilities::minimal(8, 16.0);
        caps.features.insert("avx2".to_string());
        let node = NodeInfo::new("node-1".into(), "127.0.0.1:9000".into(), caps);

        let mut req = TaskRequirements {
            min_cpu_cores: 4,
            min_memory_gb: 8.0,
            required_features: HashSet::new(),
        };
        assert!(node.meets(&req));

        req.required_features.insert("avx2".to_string());
        assert!(node.meets(&req));

        req.required_features.insert("cuda".to_string());
        assert!(!node.meets(&req));

        let too_big = TaskRequirements {
            min_cpu_cores: 64,
            ..TaskRequirements::default()
        };
        assert!(!node.meets(&too_big));
    }
}
