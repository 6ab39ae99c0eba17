//! Node scoring for placement decisions.
//!
//! Evaluates candidate nodes using a weighted combination of:
//! - **Bin-packing** (best-fit): prefer nodes that will be most full after placement
//! - **Affinity**: prefer nodes whose labels match preferred labels
//! - **Feasibility**: reject ineligible nodes and nodes that can't fit the workload
//!
//! Ties are broken by node id so that ranking is fully deterministic.

use std::cmp::Ordering;
use std::collections::HashMap;

use keelson_state::{NodeId, Resources};

/// Resource capacity and usage for a single node as seen by a scheduler.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeResources {
    pub node_id: NodeId,
    pub labels: HashMap<String, String>,
    pub capacity: Resources,
    /// Active reservations from the snapshot plus anything already proposed.
    pub used: Resources,
    /// False for draining or down nodes.
    pub is_eligible: bool,
}

impl NodeResources {
    pub fn free(&self) -> Resources {
        self.capacity.saturating_sub(&self.used)
    }
}

/// Requirements for placing one allocation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlacementRequirements {
    /// Reservation per allocation.
    pub resources: Resources,
    /// Required label matches (all must match).
    pub required_labels: HashMap<String, String>,
    /// Preferred label matches (soft affinity, adds score).
    pub preferred_labels: HashMap<String, String>,
}

/// Scored placement result for a single node.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub node_id: NodeId,
    /// Total composite score (higher = better). Range: 0.0..=100.0.
    pub score: f64,
    /// Breakdown of score components.
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    /// Bin-packing score: how full the node will be (higher = more packed).
    pub bin_packing: f64,
    /// Affinity score: how well labels match.
    pub affinity: f64,
}

/// Weights for the scoring components.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub bin_packing: f64,
    pub affinity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            bin_packing: 0.7,
            affinity: 0.3,
        }
    }
}

/// True if the node can take one more allocation with these requirements.
pub fn is_feasible(node: &NodeResources, req: &PlacementRequirements) -> bool {
    if !node.is_eligible {
        return false;
    }
    let labels_ok = req
        .required_labels
        .iter()
        .all(|(k, v)| node.labels.get(k).is_some_and(|nv| nv == v));
    labels_ok && node.used.add(&req.resources).fits_within(&node.capacity)
}

/// Score a single node for the given placement requirements.
pub fn score_node(
    node: &NodeResources,
    req: &PlacementRequirements,
    weights: &ScoringWeights,
) -> Option<NodeScore> {
    if !is_feasible(node, req) {
        return None;
    }

    // Bin-packing: average projected utilization across both dimensions.
    let projected = node.used.add(&req.resources);
    let cpu_util = ratio(u64::from(projected.cpu_weight), u64::from(node.capacity.cpu_weight));
    let mem_util = ratio(projected.memory_bytes, node.capacity.memory_bytes);
    let bin_packing = ((cpu_util + mem_util) / 2.0).min(1.0) * 100.0;

    let total_preferred = req.preferred_labels.len();
    let matched = req
        .preferred_labels
        .iter()
        .filter(|(k, v)| node.labels.get(*k).is_some_and(|nv| nv == *v))
        .count();
    let affinity = if total_preferred > 0 {
        (matched as f64 / total_preferred as f64) * 100.0
    } else {
        50.0 // Neutral when no preferences.
    };

    let score = weights.bin_packing * bin_packing + weights.affinity * affinity;

    Some(NodeScore {
        node_id: node.node_id.clone(),
        score,
        breakdown: ScoreBreakdown {
            bin_packing,
            affinity,
        },
    })
}

/// Score all nodes and return the feasible ones, best first.
pub fn rank_nodes(
    nodes: &[NodeResources],
    req: &PlacementRequirements,
    weights: &ScoringWeights,
) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = nodes
        .iter()
        .filter_map(|n| score_node(n, req, weights))
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    scores
}

fn ratio(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        0.5
    } else {
        used as f64 / capacity as f64
    }
}
