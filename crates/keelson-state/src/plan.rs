//! Plans and plan results: the exchange format between schedulers and the
//! arbiter.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{AllocDesiredStatus, AllocId, Allocation, EvalId, JobId, NodeId, PlanId};

/// A proposed, not-yet-durable set of allocation changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: PlanId,
    pub eval_id: EvalId,
    pub job_id: JobId,
    pub priority: u32,
    /// State index of the snapshot the plan was computed against.
    pub snapshot_index: u64,
    /// New or updated allocations, by target node.
    #[serde(default)]
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    /// Allocations to stop or evict, by node.
    #[serde(default)]
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
}

impl Plan {
    pub fn new(
        id: impl Into<PlanId>,
        eval_id: impl Into<EvalId>,
        job_id: impl Into<JobId>,
        priority: u32,
        snapshot_index: u64,
    ) -> Self {
        Plan {
            id: id.into(),
            eval_id: eval_id.into(),
            job_id: job_id.into(),
            priority,
            snapshot_index,
            node_allocation: BTreeMap::new(),
            node_update: BTreeMap::new(),
        }
    }

    /// Propose placing (or updating) an allocation.
    pub fn append_alloc(&mut self, alloc: Allocation) {
        self.node_allocation
            .entry(alloc.node_id.clone())
            .or_default()
            .push(alloc);
    }

    /// Propose stopping an existing allocation.
    pub fn append_stop(
        &mut self,
        alloc: &Allocation,
        desired: AllocDesiredStatus,
        description: impl Into<String>,
    ) {
        let mut stopped = alloc.clone();
        stopped.desired_status = desired;
        stopped.desired_description = description.into();
        self.node_update
            .entry(stopped.node_id.clone())
            .or_default()
            .push(stopped);
    }

    pub fn is_no_op(&self) -> bool {
        self.node_allocation.values().all(Vec::is_empty)
            && self.node_update.values().all(Vec::is_empty)
    }

    /// Total number of allocation changes proposed.
    pub fn len(&self) -> usize {
        self.node_allocation.values().map(Vec::len).sum::<usize>()
            + self.node_update.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why the arbiter refused an individual allocation change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Committed reservations plus this proposal exceed node capacity.
    CapacityExceeded,
    /// The target node is missing or no longer ready.
    NodeUnavailable,
    /// The allocation changed after the plan's snapshot was taken.
    StaleSnapshotConflict,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded => write!(f, "capacity-exceeded"),
            Self::NodeUnavailable => write!(f, "node-unavailable"),
            Self::StaleSnapshotConflict => write!(f, "stale-snapshot-conflict"),
        }
    }
}

/// One refused allocation change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedAllocation {
    pub alloc_id: AllocId,
    pub node_id: NodeId,
    pub reason: RejectReason,
}

/// The arbiter's per-allocation verdict on a plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanResult {
    pub plan_id: PlanId,
    pub eval_id: EvalId,
    /// Accepted placements, by node.
    #[serde(default)]
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    /// Accepted stops, by node.
    #[serde(default)]
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    #[serde(default)]
    pub rejected: Vec<RejectedAllocation>,
    /// State index the committed changes became visible at (0 if nothing
    /// was committed).
    pub alloc_index: u64,
    /// State index the arbiter evaluated the plan against.
    pub refresh_index: u64,
}

impl PlanResult {
    /// Number of accepted allocation changes.
    pub fn accepted_len(&self) -> usize {
        self.node_allocation.values().map(Vec::len).sum::<usize>()
            + self.node_update.values().map(Vec::len).sum::<usize>()
    }

    /// True if nothing was accepted.
    pub fn is_no_op(&self) -> bool {
        self.accepted_len() == 0
    }

    /// True if every proposed change was accepted.
    pub fn is_full_commit(&self) -> bool {
        self.rejected.is_empty()
    }

    /// Iterator over accepted placements.
    pub fn placed(&self) -> impl Iterator<Item = &Allocation> {
        self.node_allocation.values().flatten()
    }

    /// Iterator over accepted stops.
    pub fn stopped(&self) -> impl Iterator<Item = &Allocation> {
        self.node_update.values().flatten()
    }

    /// Rejections carrying the given reason.
    pub fn rejected_with(&self, reason: RejectReason) -> impl Iterator<Item = &RejectedAllocation> {
        self.rejected.iter().filter(move |r| r.reason == reason)
    }
}
