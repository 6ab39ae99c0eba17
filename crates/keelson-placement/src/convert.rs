//! Type conversions between state store types and placement types.
//!
//! Bridges `keelson_state::{NodeInfo, TaskGroup}` plus node usage to the
//! placement engine's `NodeResources` and `PlacementRequirements`.

use keelson_state::{NodeInfo, Resources, TaskGroup};

use crate::scorer::{NodeResources, PlacementRequirements};

/// Convert a [`NodeInfo`] to [`NodeResources`] given its current usage.
pub fn node_info_to_resources(node: &NodeInfo, used: Resources) -> NodeResources {
    NodeResources {
        node_id: node.id.clone(),
        labels: node.labels.clone(),
        capacity: node.capacity,
        used,
        is_eligible: node.is_eligible(),
    }
}

/// Convert a [`TaskGroup`] to the per-allocation [`PlacementRequirements`].
pub fn task_group_to_requirements(group: &TaskGroup) -> PlacementRequirements {
    PlacementRequirements {
        resources: group.resources,
        required_labels: group.required_labels.clone(),
        preferred_labels: group.preferred_labels.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_state::*;
    use std::collections::HashMap;

    fn node(id: &str, status: NodeStatus) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            address: "10.0.0.1".to_string(),
            status,
            capacity: Resources::new(10, 1024),
            labels: HashMap::from([("zone".to_string(), "a".to_string())]),
            create_index: 0,
            modify_index: 0,
        }
    }

    #[test]
    fn converts_node_with_usage() {
        let res = node_info_to_resources(&node("n1", NodeStatus::Ready), Resources::new(4, 0));
        assert_eq!(res.free(), Resources::new(6, 1024));
        assert!(res.is_eligible);
        assert_eq!(res.labels.get("zone").map(String::as_str), Some("a"));
    }

    #[test]
    fn draining_node_is_ineligible() {
        let res = node_info_to_resources(&node("n1", NodeStatus::Draining), Resources::default());
        assert!(!res.is_eligible);
    }
}
