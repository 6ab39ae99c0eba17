//! Keelson placement: feasibility, bin-packing and affinity scoring.
//!
//! This crate makes placement proposals for schedulers. It does NOT decide
//! whether a proposal may be committed (that's `keelson-plan`). It scores
//! nodes from a snapshot-derived view and assigns allocations to them.
//!
//! # Components
//!
//! - **`scorer`**: Node scoring (bin-packing, affinity, feasibility)
//! - **`placer`**: Assigns a task group's allocations across nodes
//! - **`convert`**: Type conversions from state store types

pub mod convert;
pub mod placer;
pub mod scorer;

pub use convert::{node_info_to_resources, task_group_to_requirements};
pub use placer::{PlacementPlan, compute_placement, release};
pub use scorer::{
    NodeResources, NodeScore, PlacementRequirements, ScoringWeights, is_feasible, rank_nodes,
    score_node,
};
