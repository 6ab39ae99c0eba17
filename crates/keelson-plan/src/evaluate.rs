//! Plan evaluation: the arbiter's per-allocation verdict.
//!
//! Evaluation is pure: it reads the arbiter's current snapshot and the plan,
//! and decides which changes may commit. Stops are checked first so the
//! capacity they free is available to placements on the same node. Nodes
//! are visited in id order and allocations in plan order, and placements
//! are accepted greedily.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use keelson_scheduler::PlanError;
use keelson_state::{
    Allocation, NodeId, NodeInfo, Plan, PlanResult, RejectReason, RejectedAllocation, Resources,
    StateSnapshot, check_node_id,
};
use tracing::debug;

/// Committed state of one node as seen while evaluating a plan.
struct NodeLedger {
    info: Option<NodeInfo>,
    /// Active reservations, adjusted for changes accepted so far.
    used: Resources,
}

struct Ledgers<'s> {
    snapshot: &'s StateSnapshot,
    nodes: BTreeMap<NodeId, NodeLedger>,
}

impl<'s> Ledgers<'s> {
    fn new(snapshot: &'s StateSnapshot) -> Self {
        Self {
            snapshot,
            nodes: BTreeMap::new(),
        }
    }

    fn get(&mut self, node_id: &str) -> Result<&mut NodeLedger, PlanError> {
        match self.nodes.entry(node_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let ledger = NodeLedger {
                    info: self.snapshot.node(node_id)?,
                    used: self.snapshot.node_usage(node_id)?,
                };
                Ok(entry.insert(ledger))
            }
        }
    }
}

/// Decide which of `plan`'s changes can be applied on top of `snapshot`.
pub fn evaluate_plan(snapshot: &StateSnapshot, plan: &Plan) -> Result<PlanResult, PlanError> {
    validate(snapshot, plan)?;

    let mut result = PlanResult {
        plan_id: plan.id.clone(),
        eval_id: plan.eval_id.clone(),
        refresh_index: snapshot.index(),
        ..PlanResult::default()
    };
    let mut ledgers = Ledgers::new(snapshot);
    let mut stopped: HashSet<&str> = HashSet::new();

    for (node_id, stops) in &plan.node_update {
        for stop in stops {
            let current = snapshot.allocation(&stop.id)?;
            let Some(current) = current.filter(|c| {
                c.modify_index <= plan.snapshot_index && c.node_id == *node_id
            }) else {
                reject(&mut result, stop, RejectReason::StaleSnapshotConflict);
                continue;
            };
            if current.is_active() {
                let ledger = ledgers.get(node_id)?;
                ledger.used = ledger.used.saturating_sub(&current.resources);
            }
            stopped.insert(stop.id.as_str());
            accept(&mut result.node_update, stop);
        }
    }

    for (node_id, allocs) in &plan.node_allocation {
        for alloc in allocs {
            let ledger = ledgers.get(node_id)?;
            let Some(capacity) = ledger
                .info
                .as_ref()
                .filter(|n| n.is_eligible())
                .map(|n| n.capacity)
            else {
                reject(&mut result, alloc, RejectReason::NodeUnavailable);
                continue;
            };

            let mut credit = Resources::default();
            if let Some(previous) = snapshot.allocation(&alloc.id)? {
                if previous.modify_index > plan.snapshot_index
                    || previous.node_id != alloc.node_id
                    || previous.job_id != alloc.job_id
                {
                    reject(&mut result, alloc, RejectReason::StaleSnapshotConflict);
                    continue;
                }
                if previous.is_active() && !stopped.contains(previous.id.as_str()) {
                    credit = previous.resources;
                }
            }

            let ledger = ledgers.get(node_id)?;
            let projected = ledger.used.saturating_sub(&credit).add(&alloc.resources);
            if !projected.fits_within(&capacity) {
                reject(&mut result, alloc, RejectReason::CapacityExceeded);
                continue;
            }
            ledger.used = projected;
            accept(&mut result.node_allocation, alloc);
        }
    }

    debug!(
        plan_id = %plan.id,
        eval_id = %plan.eval_id,
        accepted = result.accepted_len(),
        rejected = result.rejected.len(),
        snapshot_index = plan.snapshot_index,
        refresh_index = result.refresh_index,
        "plan evaluated"
    );
    Ok(result)
}

fn accept(into: &mut BTreeMap<NodeId, Vec<Allocation>>, alloc: &Allocation) {
    into.entry(alloc.node_id.clone())
        .or_default()
        .push(alloc.clone());
}

fn reject(result: &mut PlanResult, alloc: &Allocation, reason: RejectReason) {
    debug!(plan_id = %result.plan_id, alloc_id = %alloc.id, node_id = %alloc.node_id, %reason, "allocation rejected");
    result.rejected.push(RejectedAllocation {
        alloc_id: alloc.id.clone(),
        node_id: alloc.node_id.clone(),
        reason,
    });
}

/// Structural checks. A plan that fails these is not arbitrated at all.
fn validate(snapshot: &StateSnapshot, plan: &Plan) -> Result<(), PlanError> {
    let invalid = |reason: String| PlanError::InvalidPlan {
        plan_id: plan.id.clone(),
        reason,
    };

    if plan.snapshot_index > snapshot.index() {
        return Err(invalid(format!(
            "snapshot index {} is ahead of arbiter state {}",
            plan.snapshot_index,
            snapshot.index()
        )));
    }

    for (section, by_node) in [("placement", &plan.node_allocation), ("stop", &plan.node_update)] {
        let mut seen = HashSet::new();
        for (node_id, allocs) in by_node {
            check_node_id(node_id).map_err(&invalid)?;
            for alloc in allocs {
                if alloc.node_id != *node_id {
                    return Err(invalid(format!(
                        "{section} {} targets node {} but is listed under {node_id}",
                        alloc.id, alloc.node_id
                    )));
                }
                if !seen.insert(alloc.id.as_str()) {
                    return Err(invalid(format!("duplicate {section} {}", alloc.id)));
                }
            }
        }
    }
    Ok(())
}
