//! System scheduler: one allocation per task group on every eligible node.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use keelson_placement::{is_feasible, release, task_group_to_requirements};
use keelson_state::{AllocDesiredStatus, Allocation, Evaluation, Job, StateSnapshot};
use tracing::debug;

use crate::driver::{self, Proposal};
use crate::error::SchedulerResult;
use crate::generic::{ClusterView, active_allocs, new_alloc, new_plan, stop_lost};
use crate::registry::SYSTEM;
use crate::retry::DEFAULT_SERVICE_ATTEMPTS;
use crate::scheduler::{Planner, ProcessFuture, Scheduler};

pub struct SystemScheduler {
    state: StateSnapshot,
    planner: Arc<dyn Planner>,
    retry_limit: u32,
}

impl SystemScheduler {
    pub fn factory(state: StateSnapshot, planner: Arc<dyn Planner>) -> Box<dyn Scheduler> {
        Box::new(Self {
            state,
            planner,
            retry_limit: DEFAULT_SERVICE_ATTEMPTS,
        })
    }
}

impl Scheduler for SystemScheduler {
    fn process<'a>(&'a mut self, eval: &'a Evaluation) -> ProcessFuture<'a> {
        Box::pin(async move {
            driver::drive(
                SYSTEM,
                &mut self.state,
                self.planner.as_ref(),
                eval,
                self.retry_limit,
                &propose,
            )
            .await
        })
    }

    fn set_retry_limit(&mut self, attempts: u32) {
        self.retry_limit = attempts;
    }
}

fn propose(
    snapshot: &StateSnapshot,
    eval: &Evaluation,
    job: Option<&Job>,
) -> SchedulerResult<Proposal> {
    let mut plan = new_plan(snapshot, eval);
    let mut failed = BTreeMap::new();
    let active = active_allocs(snapshot, eval)?;

    let job = match job {
        Some(job) if !job.stopped => job,
        other => {
            let reason = if other.is_some() { "job stopped" } else { "job not found" };
            for alloc in &active {
                plan.append_stop(alloc, AllocDesiredStatus::Stop, reason);
            }
            return Ok(Proposal { plan, failed });
        }
    };

    let mut view = ClusterView::load(snapshot, eval)?;

    for alloc in &active {
        if job.task_group(&alloc.task_group).is_none() {
            plan.append_stop(alloc, AllocDesiredStatus::Stop, "task group removed");
            release(&mut view.resources, &alloc.node_id, &alloc.resources);
        }
    }

    for group in &job.task_groups {
        let req = task_group_to_requirements(group);
        let mut on_node: BTreeMap<&str, Vec<&Allocation>> = BTreeMap::new();
        for alloc in active.iter().filter(|a| a.task_group == group.name) {
            on_node.entry(alloc.node_id.as_str()).or_default().push(alloc);
        }

        let mut taken = BTreeSet::new();
        for (node_id, allocs) in &on_node {
            for (i, alloc) in allocs.iter().enumerate() {
                if view.is_lost(alloc) {
                    stop_lost(&mut plan, alloc);
                } else if i > 0 {
                    plan.append_stop(alloc, AllocDesiredStatus::Stop, "duplicate on node");
                    release(&mut view.resources, &alloc.node_id, &alloc.resources);
                } else if !view.nodes.get(*node_id).is_some_and(|n| {
                    req.required_labels
                        .iter()
                        .all(|(k, v)| n.labels.get(k) == Some(v))
                }) {
                    plan.append_stop(alloc, AllocDesiredStatus::Stop, "node no longer matches");
                } else if let Some(index) = alloc.name_index() {
                    taken.insert(index);
                }
            }
        }

        // New slots take the lowest indices no kept allocation holds.
        let mut free = (0u32..).filter(|i| !taken.contains(i));
        for node in view.resources.iter_mut() {
            if !node.is_eligible || on_node.contains_key(node.node_id.as_str()) {
                continue;
            }
            let labels_ok = req
                .required_labels
                .iter()
                .all(|(k, v)| node.labels.get(k) == Some(v));
            if !labels_ok {
                continue;
            }
            if !is_feasible(node, &req) {
                *failed.entry(group.name.clone()).or_insert(0) += 1;
                continue;
            }
            let Some(index) = free.next() else {
                break;
            };
            node.used = node.used.add(&req.resources);
            plan.append_alloc(new_alloc(snapshot, eval, group, index, node.node_id.clone()));
        }
        debug!(eval_id = %eval.id, group = %group.name, "system task group reconciled");
    }

    Ok(Proposal { plan, failed })
}
