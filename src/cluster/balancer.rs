//! Load balancing policies
//!
//! Selects a dispatch target from the coordinator's member list. Failed
//! and over-committed nodes are never selected. When no node qualifies,
//! selection returns `None` and the caller treats it as transient.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::node::{NodeId, NodeInfo, NodeStatus, TaskRequirements};

/// Node selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceStrategy {
    /// Cycle through eligible nodes.
    RoundRobin,
    /// Pick the smallest load; ties break by id.
    LeastLoaded,
    /// Pick with probability proportional to `capacity / (1 + load)`.
    Weighted,
    /// Filter to nodes meeting the task requirements, then least-loaded.
    Capability,
}

/// Stateful node selector.
pub struct LoadBalancer {
    strategy: BalanceStrategy,
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    /// Create a balancer with the given policy.
    pub fn new(strategy: BalanceStrategy) -> Self {
        Self {
            strategy,
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    /// The active policy.
    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    /// Pick a node for a task, or `None` when nothing qualifies.
    pub fn select(
        &self,
        nodes: &[NodeInfo],
        requirements: Option<&TaskRequirements>,
    ) -> Option<NodeId> {
        let mut eligible: Vec<&NodeInfo> = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Active)
            .collect();
        if let Some(req) = requirements {
            eligible.retain(|n| n.meets(req));
        }
        if eligible.is_empty() {
            return None;
        }
        // Stable order so the counter-based policies are deterministic
        // regardless of how the snapshot was produced.
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        let chosen = match self.strategy {
            BalanceStrategy::RoundRobin => {
                let index =
                    self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
                eligible[index]
            }
            BalanceStrategy::LeastLoaded | BalanceStrategy::Capability => {
                Self::least_loaded(&eligible)
            }
            BalanceStrategy::Weighted => Self::weighted(&eligible),
        };
        Some(chosen.id.clone())
    }

    fn least_loaded<'a>(eligible: &[&'a NodeInfo]) -> &'a NodeInfo {
        eligible
            .iter()
            .min_by(|a, b| {
                a.load
                    .partial_cmp(&b.load)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .expect("eligible list is non-empty")
    }

    fn weighted<'a>(eligible: &[&'a NodeInfo]) -> &'a NodeInfo {
        let weights: Vec<f64> = eligible
            .iter()
            .map(|n| n.capabilities.cpu_cores.max(1) as f64 / (1.0 + n.load.max(0.0)))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return eligible[0];
        }

        let mut point = rand::thread_rng().gen_range(0.0..total);
        for (node, weight) in eligible.iter().zip(weights) {
            if point < weight {
                return node;
            }
            point -= weight;
        }
        eligible[eligible.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeCapabilities;
    use std::collections::HashSet;

    fn node(id: &str, load: f64, cores: usize) -> NodeInfo {
        let mut info = NodeInfo::new(
            id.to_string(),
            format!("127.0.0.1:{}", 7000),
            NodeCapabilities::minimal(cores, 8.0),
        );
        info.load = load;
        info
    }

    #[test]
    fn test_round_robin_cycles() {
        let balancer = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let nodes = vec![node("a", 0.1, 4), node("b", 0.2, 4), node("c", 0.3, 4)];

        let picks: Vec<NodeId> = (0..6)
            .map(|_| balancer.select(&nodes, None).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_least_loaded_with_id_tiebreak() {
        let balancer = LoadBalancer::new(BalanceStrategy::LeastLoaded);
        let nodes = vec![node("b", 0.2, 4), node("a", 0.2, 4), node("c", 0.5, 4)];

        // Equal lowest load on a and b resolves to the smaller id.
        assert_eq!(balancer.select(&nodes, None).unwrap(), "a");
    }

    #[test]
    fn test_failed_and_degraded_excluded() {
        let balancer = LoadBalancer::new(BalanceStrategy::LeastLoaded);
        let mut failed = node("a", 0.0, 4);
        failed.status = NodeStatus::Failed;
        let mut degraded = node("b", 0.1, 4);
        degraded.record_heartbeat(1.7);
        let healthy = node("c", 0.9, 4);

        let nodes = vec![failed, degraded, healthy];
        assert_eq!(balancer.select(&nodes, None).unwrap(), "c");
    }

    #[test]
    fn test_no_eligible_node_returns_none() {
        let balancer = LoadBalancer::new(BalanceStrategy::RoundRobin);
        assert!(balancer.select(&[], None).is_none());

        let mut dead = node("a", 0.0, 4);
        dead.status = NodeStatus::Failed;
        assert!(balancer.select(&[dead], None).is_none());
    }

    #[test]
    fn test_capability_filters_then_least_loaded() {
        let balancer = LoadBalancer::new(BalanceStrategy::Capability);
        let mut gpu_node = node("gpu", 0.8, 8);
        gpu_node.capabilities.features.insert("avx2".to_string());
        let cheap_node = node("cheap", 0.1, 2);

        let req = TaskRequirements {
            min_cpu_cores: 4,
            min_memory_gb: 0.0,
            required_features: HashSet::from(["avx2".to_string()]),
        };

        let nodes = vec![gpu_node, cheap_node];
        // Only the feature-bearing node qualifies despite its higher load.
        assert_eq!(balancer.select(&nodes, Some(&req)).unwrap(), "gpu");
        // Without requirements the lightly loaded node wins.
        assert_eq!(balancer.select(&nodes, None).unwrap(), "cheap");
    }

    #[test]
    fn test_weighted_prefers_spare_capacity() {
        let balancer = LoadBalancer::new(BalanceStrategy::Weighted);
        let nodes = vec![node("big", 0.0, 32), node("small", 0.9, 1)];

        let mut big_picks = 0;
        for _ in 0..200 {
            if balancer.select(&nodes, None).unwrap() == "big" {
                big_picks += 1;
            }
        }
        // 32/1.0 vs 1/1.9 weight ratio: the big node dominates.
        assert!(big_picks > 150);
    }
}
