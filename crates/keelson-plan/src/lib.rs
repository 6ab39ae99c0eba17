//! keelson-plan: the plan arbiter.
//!
//! Schedulers compute plans optimistically against snapshots that may
//! already be stale. The arbiter is the single point where plans meet
//! authoritative state: it evaluates each plan against the current
//! snapshot, commits the acceptable subset atomically and tells the
//! submitter what was rejected and why.
//!
//! # Components
//!
//! - **`evaluate`**: Pure per-allocation verdicts (`evaluate_plan`)
//! - **`applier`**: Serialized plan queue, `PlanSink` storage seam
//! - **`planner`**: `ArbiterPlanner`, the `Planner` handed to schedulers

pub mod applier;
pub mod evaluate;
pub mod planner;

pub use applier::{ArbiterHandle, DEFAULT_QUEUE_DEPTH, PlanApplier, PlanSink};
pub use evaluate::evaluate_plan;
pub use planner::ArbiterPlanner;
