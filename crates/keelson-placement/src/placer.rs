//! Placement engine: assigns allocations of one task group to nodes.
//!
//! The placer works on a scheduler's private view of the cluster: a set of
//! [`NodeResources`] built from a snapshot. Each assignment is charged
//! against that view before the next one is ranked, so a single proposal
//! never oversubscribes a node by its own count. Whether the proposal still
//! fits at commit time is decided later by the plan arbiter.

use keelson_state::{NodeId, Resources};
use tracing::{debug, warn};

use crate::scorer::{NodeResources, PlacementRequirements, ScoringWeights, rank_nodes};

/// Result of placing `wanted` allocations for one task group.
#[derive(Debug, Clone, Default)]
pub struct PlacementPlan {
    /// Chosen node per instance, in placement order.
    pub assignments: Vec<NodeId>,
    /// Instances that could not be placed anywhere.
    pub unplaced: u32,
}

/// Place `wanted` allocations with identical requirements.
///
/// Nodes are re-ranked after every assignment, and `nodes` is updated in
/// place so that subsequent groups of the same proposal see the reservations
/// made here.
pub fn compute_placement(
    req: &PlacementRequirements,
    group: &str,
    wanted: u32,
    nodes: &mut [NodeResources],
    weights: &ScoringWeights,
) -> PlacementPlan {
    let mut plan = PlacementPlan::default();

    for _ in 0..wanted {
        let ranked = rank_nodes(nodes, req, weights);
        let Some(best) = ranked.first() else {
            plan.unplaced += 1;
            continue;
        };
        debug!(group, node = %best.node_id, score = best.score, "placed allocation");

        if let Some(node) = nodes.iter_mut().find(|n| n.node_id == best.node_id) {
            node.used = node.used.add(&req.resources);
        }
        plan.assignments.push(best.node_id.clone());
    }

    if plan.unplaced > 0 {
        warn!(
            group,
            unplaced = plan.unplaced,
            "could not place all allocations: insufficient cluster capacity"
        );
    }
    plan
}

/// Release a reservation from the working view, e.g. for an allocation the
/// same proposal is stopping. `reserved` is what the allocation actually
/// holds, which may differ from its task group's current requirements.
pub fn release(nodes: &mut [NodeResources], node_id: &str, reserved: &Resources) {
    if let Some(node) = nodes.iter_mut().find(|n| n.node_id == node_id) {
        node.used = node.used.saturating_sub(reserved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_node(id: &str, cpu: u32) -> NodeResources {
        NodeResources {
            node_id: id.to_string(),
            labels: HashMap::new(),
            capacity: Resources::new(cpu, 1024),
            used: Resources::default(),
            is_eligible: true,
        }
    }

    fn req(cpu: u32) -> PlacementRequirements {
        PlacementRequirements {
            resources: Resources::new(cpu, 0),
            required_labels: HashMap::new(),
            preferred_labels: HashMap::new(),
        }
    }

    #[test]
    fn places_all_when_capacity_allows() {
        let mut nodes = vec![make_node("n1", 10), make_node("n2", 10)];
        let plan = compute_placement(&req(4), "web", 4, &mut nodes, &ScoringWeights::default());
        assert_eq!(plan.assignments.len(), 4);
        assert_eq!(plan.unplaced, 0);
        assert!(nodes.iter().all(|n| n.used.fits_within(&n.capacity)));
    }

    #[test]
    fn never_oversubscribes_within_one_proposal() {
        let mut nodes = vec![make_node("n1", 10)];
        let plan = compute_placement(&req(4), "web", 3, &mut nodes, &ScoringWeights::default());
        assert_eq!(plan.assignments, vec!["n1".to_string(), "n1".to_string()]);
        assert_eq!(plan.unplaced, 1);
        assert_eq!(nodes[0].used.cpu_weight, 8);
    }

    #[test]
    fn bin_packing_fills_one_node_first() {
        let mut nodes = vec![make_node("n1", 10), make_node("n2", 10)];
        let weights = ScoringWeights {
            bin_packing: 1.0,
            affinity: 0.0,
        };
        let plan = compute_placement(&req(5), "web", 2, &mut nodes, &weights);
        assert_eq!(plan.assignments, vec!["n1".to_string(), "n1".to_string()]);
    }

    #[test]
    fn ineligible_nodes_receive_nothing() {
        let mut nodes = vec![make_node("n1", 10), make_node("n2", 10)];
        nodes[0].is_eligible = false;
        let plan = compute_placement(&req(1), "web", 3, &mut nodes, &ScoringWeights::default());
        assert!(plan.assignments.iter().all(|n| n == "n2"));
    }

    #[test]
    fn release_frees_working_capacity() {
        let mut nodes = vec![make_node("n1", 10)];
        nodes[0].used = Resources::new(10, 0);
        release(&mut nodes, "n1", &Resources::new(4, 0));
        let plan = compute_placement(&req(4), "web", 1, &mut nodes, &ScoringWeights::default());
        assert_eq!(plan.unplaced, 0);
    }

    #[test]
    fn release_credits_only_what_was_reserved() {
        let mut nodes = vec![make_node("n1", 10)];
        nodes[0].used = Resources::new(9, 0);
        release(&mut nodes, "n1", &Resources::new(3, 0));
        assert_eq!(nodes[0].used.cpu_weight, 6);

        let plan = compute_placement(&req(8), "web", 1, &mut nodes, &ScoringWeights::default());
        assert_eq!(plan.unplaced, 1);
    }
}
