//! Generic scheduler for `service` and `batch` jobs.
//!
//! For each task group the scheduler keeps `count` active allocations:
//! allocations on down or vanished nodes are stopped as lost, surplus
//! allocations are stopped, and missing instances are placed on the
//! best-ranked feasible node. A stopped or deleted job has all of its active
//! allocations stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use keelson_placement::{
    NodeResources, ScoringWeights, compute_placement, node_info_to_resources, release,
    task_group_to_requirements,
};
use keelson_state::{
    AllocClientStatus, AllocDesiredStatus, Allocation, Evaluation, Job, NodeInfo, NodeStatus, Plan,
    StateSnapshot, alloc_name,
};
use tracing::debug;

use crate::driver::{self, Proposal, state_err};
use crate::error::SchedulerResult;
use crate::ids;
use crate::registry::{BATCH, SERVICE};
use crate::retry::{DEFAULT_BATCH_ATTEMPTS, DEFAULT_SERVICE_ATTEMPTS};
use crate::scheduler::{Planner, ProcessFuture, Scheduler};

pub struct GenericScheduler {
    kind: &'static str,
    state: StateSnapshot,
    planner: Arc<dyn Planner>,
    retry_limit: u32,
    weights: ScoringWeights,
}

impl GenericScheduler {
    /// Factory for the `service` scheduler.
    pub fn service(state: StateSnapshot, planner: Arc<dyn Planner>) -> Box<dyn Scheduler> {
        Box::new(Self::new(SERVICE, state, planner, DEFAULT_SERVICE_ATTEMPTS))
    }

    /// Factory for the `batch` scheduler.
    pub fn batch(state: StateSnapshot, planner: Arc<dyn Planner>) -> Box<dyn Scheduler> {
        Box::new(Self::new(BATCH, state, planner, DEFAULT_BATCH_ATTEMPTS))
    }

    fn new(
        kind: &'static str,
        state: StateSnapshot,
        planner: Arc<dyn Planner>,
        retry_limit: u32,
    ) -> Self {
        Self {
            kind,
            state,
            planner,
            retry_limit,
            weights: ScoringWeights::default(),
        }
    }
}

impl Scheduler for GenericScheduler {
    fn process<'a>(&'a mut self, eval: &'a Evaluation) -> ProcessFuture<'a> {
        Box::pin(async move {
            let weights = self.weights.clone();
            let proposer = move |snapshot: &StateSnapshot, eval: &Evaluation, job: Option<&Job>| {
                propose(snapshot, eval, job, &weights)
            };
            driver::drive(
                self.kind,
                &mut self.state,
                self.planner.as_ref(),
                eval,
                self.retry_limit,
                &proposer,
            )
            .await
        })
    }

    fn set_retry_limit(&mut self, attempts: u32) {
        self.retry_limit = attempts;
    }
}

/// Snapshot-derived working view shared by the builtin schedulers.
pub(crate) struct ClusterView {
    pub nodes: BTreeMap<String, NodeInfo>,
    pub resources: Vec<NodeResources>,
}

impl ClusterView {
    pub fn load(snapshot: &StateSnapshot, eval: &Evaluation) -> SchedulerResult<Self> {
        let mut nodes = BTreeMap::new();
        let mut resources = Vec::new();
        for node in snapshot.nodes().map_err(state_err(eval))? {
            let node = node.map_err(state_err(eval))?;
            let used = snapshot.node_usage(&node.id).map_err(state_err(eval))?;
            resources.push(node_info_to_resources(&node, used));
            nodes.insert(node.id.clone(), node);
        }
        Ok(Self { nodes, resources })
    }

    /// True if the node the allocation sits on is gone or down.
    pub fn is_lost(&self, alloc: &Allocation) -> bool {
        self.nodes
            .get(&alloc.node_id)
            .is_none_or(|n| n.status == NodeStatus::Down)
    }
}

/// Active allocations of the evaluation's job.
pub(crate) fn active_allocs(
    snapshot: &StateSnapshot,
    eval: &Evaluation,
) -> SchedulerResult<Vec<Allocation>> {
    let mut allocs = Vec::new();
    for alloc in snapshot.allocs_by_job(&eval.job_id).map_err(state_err(eval))? {
        let alloc = alloc.map_err(state_err(eval))?;
        if alloc.is_active() {
            allocs.push(alloc);
        }
    }
    Ok(allocs)
}

pub(crate) fn new_plan(snapshot: &StateSnapshot, eval: &Evaluation) -> Plan {
    Plan::new(
        ids::plan_id(&eval.id, snapshot.index()),
        eval.id.clone(),
        eval.job_id.clone(),
        eval.priority,
        snapshot.index(),
    )
}

pub(crate) fn stop_lost(plan: &mut Plan, alloc: &Allocation) {
    let mut lost = alloc.clone();
    lost.client_status = AllocClientStatus::Lost;
    plan.append_stop(&lost, AllocDesiredStatus::Stop, "node down");
}

/// A fresh allocation for `group` proposed by `eval`.
pub(crate) fn new_alloc(
    snapshot: &StateSnapshot,
    eval: &Evaluation,
    group: &keelson_state::TaskGroup,
    index: u32,
    node_id: String,
) -> Allocation {
    let name = alloc_name(&eval.job_id, &group.name, index);
    Allocation {
        id: ids::alloc_id(&eval.id, snapshot.index(), &name),
        name,
        node_id,
        eval_id: eval.id.clone(),
        job_id: eval.job_id.clone(),
        task_group: group.name.clone(),
        resources: group.resources,
        desired_status: AllocDesiredStatus::Run,
        desired_description: String::new(),
        client_status: AllocClientStatus::Pending,
        create_index: 0,
        modify_index: 0,
    }
}

fn propose(
    snapshot: &StateSnapshot,
    eval: &Evaluation,
    job: Option<&Job>,
    weights: &ScoringWeights,
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
    let mut by_group: BTreeMap<&str, Vec<&Allocation>> = BTreeMap::new();
    for alloc in &active {
        if job.task_group(&alloc.task_group).is_none() {
            plan.append_stop(alloc, AllocDesiredStatus::Stop, "task group removed");
            release(&mut view.resources, &alloc.node_id, &alloc.resources);
            continue;
        }
        by_group.entry(alloc.task_group.as_str()).or_default().push(alloc);
    }

    for group in &job.task_groups {
        let req = task_group_to_requirements(group);
        let mut existing = by_group.remove(group.name.as_str()).unwrap_or_default();
        existing.sort_by_key(|a| (a.name_index().unwrap_or(u32::MAX), a.id.clone()));

        let mut kept: Vec<&Allocation> = Vec::new();
        for alloc in existing {
            if view.is_lost(alloc) {
                stop_lost(&mut plan, alloc);
                release(&mut view.resources, &alloc.node_id, &alloc.resources);
            } else if kept.len() as u32 >= group.count {
                plan.append_stop(alloc, AllocDesiredStatus::Stop, "scaled down");
                release(&mut view.resources, &alloc.node_id, &alloc.resources);
            } else {
                kept.push(alloc);
            }
        }

        let taken: BTreeSet<u32> = kept.iter().filter_map(|a| a.name_index()).collect();
        let missing: Vec<u32> = (0..)
            .filter(|i| !taken.contains(i))
            .take(group.count.saturating_sub(kept.len() as u32) as usize)
            .collect();
        if missing.is_empty() {
            continue;
        }

        let placement = compute_placement(
            &req,
            &group.name,
            missing.len() as u32,
            &mut view.resources,
            weights,
        );
        for (index, node_id) in missing.iter().zip(placement.assignments) {
            plan.append_alloc(new_alloc(snapshot, eval, group, *index, node_id));
        }
        if placement.unplaced > 0 {
            failed.insert(group.name.clone(), placement.unplaced);
        }
        debug!(
            eval_id = %eval.id,
            group = %group.name,
            kept = kept.len(),
            missing = missing.len(),
            unplaced = placement.unplaced,
            "task group reconciled"
        );
    }

    Ok(Proposal { plan, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SchedulerRegistry;
    use crate::testing::*;
    use keelson_state::{EvalStatus, RejectReason, StateStore};

    #[tokio::test]
    async fn places_missing_allocations() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        store.put_node(&ready_node("n2", 10)).unwrap();
        let job = service_job("web", 3, 4);
        store.put_job(&job).unwrap();
        let eval = stored_eval(&store, "e1", &job);

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        let mut sched = SchedulerRegistry::builtin()
            .instantiate(SERVICE, store.snapshot().unwrap(), planner.clone())
            .unwrap();
        sched.process(&eval).await.unwrap();

        let plans = planner.submitted();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].node_allocation.values().map(Vec::len).sum::<usize>(), 3);

        let done = planner.last_update().unwrap();
        assert_eq!(done.status, EvalStatus::Complete);
        assert!(done.failed_placements.is_empty());
        assert_eq!(done.attempts, 1);
    }

    #[tokio::test]
    async fn identical_inputs_produce_identical_plans() {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["n1", "n2", "n3"] {
            store.put_node(&ready_node(id, 10)).unwrap();
        }
        let job = service_job("web", 4, 3);
        store.put_job(&job).unwrap();
        let eval = stored_eval(&store, "e1", &job);
        let snapshot = store.snapshot().unwrap();

        let mut plans = Vec::new();
        for _ in 0..2 {
            let planner = Arc::new(RecordingPlanner::default());
            let mut sched = GenericScheduler::service(snapshot.clone(), planner.clone());
            sched.process(&eval).await.unwrap();
            plans.extend(planner.submitted());
        }
        assert_eq!(plans[0], plans[1]);
    }

    #[tokio::test]
    async fn infeasible_placement_completes_with_failures() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let job = service_job("web", 3, 4);
        store.put_job(&job).unwrap();
        let eval = stored_eval(&store, "e1", &job);

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        let mut sched = GenericScheduler::service(store.snapshot().unwrap(), planner.clone());
        sched.process(&eval).await.unwrap();

        let done = planner.last_update().unwrap();
        assert_eq!(done.status, EvalStatus::Complete);
        assert_eq!(done.failed_placements.get("g"), Some(&1));
        assert!(done.status_description.contains("g: 1"));
        assert_eq!(store.snapshot().unwrap().node_usage("n1").unwrap().cpu_weight, 8);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let job = service_job("web", 2, 2);
        store.put_job(&job).unwrap();
        let eval = stored_eval(&store, "e1", &job);

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval)
            .await
            .unwrap();
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval)
            .await
            .unwrap();

        assert_eq!(planner.submitted().len(), 1);
        assert_eq!(planner.updates().len(), 2);
    }

    #[tokio::test]
    async fn stopped_job_stops_allocations() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let mut job = service_job("web", 2, 2);
        store.put_job(&job).unwrap();
        let eval = stored_eval(&store, "e1", &job);
        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval)
            .await
            .unwrap();

        job.stopped = true;
        store.put_job(&job).unwrap();
        let eval2 = stored_eval(&store, "e2", &job);
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval2)
            .await
            .unwrap();

        let plans = planner.submitted();
        assert_eq!(plans[1].node_update.values().map(Vec::len).sum::<usize>(), 2);
        assert_eq!(store.snapshot().unwrap().node_usage("n1").unwrap().cpu_weight, 0);
    }

    #[tokio::test]
    async fn allocations_on_down_nodes_are_replaced() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let job = service_job("web", 1, 4);
        store.put_job(&job).unwrap();
        let eval = stored_eval(&store, "e1", &job);
        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval)
            .await
            .unwrap();

        store.update_node_status("n1", NodeStatus::Down).unwrap();
        store.put_node(&ready_node("n2", 10)).unwrap();
        let eval2 = stored_eval(&store, "e2", &job);
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval2)
            .await
            .unwrap();

        let plan = &planner.submitted()[1];
        let stopped: Vec<&Allocation> = plan.node_update.values().flatten().collect();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].client_status, AllocClientStatus::Lost);
        let placed: Vec<&Allocation> = plan.node_allocation.values().flatten().collect();
        assert_eq!(placed[0].node_id, "n2");
        assert_eq!(placed[0].name, "web.g[0]");
    }

    #[tokio::test]
    async fn scale_down_stops_highest_indexes() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 100)).unwrap();
        let mut job = service_job("web", 4, 1);
        store.put_job(&job).unwrap();
        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        let eval = stored_eval(&store, "e1", &job);
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval)
            .await
            .unwrap();

        job.task_groups[0].count = 2;
        store.put_job(&job).unwrap();
        let eval2 = stored_eval(&store, "e2", &job);
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval2)
            .await
            .unwrap();

        let mut stopped: Vec<String> = planner.submitted()[1]
            .node_update
            .values()
            .flatten()
            .map(|a| a.name.clone())
            .collect();
        stopped.sort();
        assert_eq!(stopped, vec!["web.g[2]".to_string(), "web.g[3]".to_string()]);
    }

    #[tokio::test]
    async fn stops_credit_the_reservation_actually_held() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let mut job = service_job("web", 2, 3);
        store.put_job(&job).unwrap();
        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        let eval = stored_eval(&store, "e1", &job);
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval)
            .await
            .unwrap();

        // g shrinks to one larger instance; b needs more than the one stop frees.
        job.task_groups[0].count = 1;
        job.task_groups[0].resources.cpu_weight = 8;
        let mut b = job.task_groups[0].clone();
        b.name = "b".to_string();
        job.task_groups.push(b);
        store.put_job(&job).unwrap();
        let eval2 = stored_eval(&store, "e2", &job);
        let snapshot = store.snapshot().unwrap();
        let used = snapshot.node_usage("n1").unwrap().cpu_weight;
        GenericScheduler::service(snapshot, planner.clone())
            .process(&eval2)
            .await
            .unwrap();

        let plan = &planner.submitted()[1];
        let freed: u32 = plan.node_update.values().flatten().map(|a| a.resources.cpu_weight).sum();
        let placed: u32 = plan
            .node_allocation
            .values()
            .flatten()
            .map(|a| a.resources.cpu_weight)
            .sum();
        assert_eq!(freed, 3);
        assert!(used - freed + placed <= 10);

        let done = planner.last_update().unwrap();
        assert_eq!(done.status, EvalStatus::Complete);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.failed_placements.get("b"), Some(&1));
    }

    #[tokio::test]
    async fn rejection_triggers_retry_against_refreshed_state() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let job = service_job("web", 1, 4);
        store.put_job(&job).unwrap();
        let eval = stored_eval(&store, "e1", &job);

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        planner.reject_next(RejectReason::CapacityExceeded);
        let mut sched = GenericScheduler::service(store.snapshot().unwrap(), planner.clone());
        sched.process(&eval).await.unwrap();

        assert_eq!(planner.submitted().len(), 2);
        let done = planner.last_update().unwrap();
        assert_eq!(done.status, EvalStatus::Complete);
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_evaluation() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let job = service_job("web", 1, 4);
        store.put_job(&job).unwrap();
        let eval = stored_eval(&store, "e1", &job);

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        for _ in 0..3 {
            planner.reject_next(RejectReason::StaleSnapshotConflict);
        }
        let mut sched = GenericScheduler::service(store.snapshot().unwrap(), planner.clone());
        sched.set_retry_limit(3);
        let err = sched.process(&eval).await.unwrap_err();

        assert!(matches!(
            err,
            crate::SchedulerError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(planner.last_update().unwrap().status, EvalStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_evaluation_submits_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let job = service_job("web", 1, 4);
        store.put_job(&job).unwrap();
        let eval = stored_eval(&store, "e1", &job);
        store.cancel_evaluation("e1", "superseded").unwrap();

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        GenericScheduler::service(store.snapshot().unwrap(), planner.clone())
            .process(&eval)
            .await
            .unwrap();

        assert!(planner.submitted().is_empty());
        assert!(planner.updates().is_empty());
    }

    #[tokio::test]
    async fn mismatched_scheduler_type_is_malformed() {
        let store = StateStore::open_in_memory().unwrap();
        let job = service_job("web", 1, 4);
        let eval = stored_eval(&store, "e1", &job);

        let planner = Arc::new(RecordingPlanner::default());
        let err = GenericScheduler::batch(store.snapshot().unwrap(), planner)
            .process(&eval)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::SchedulerError::MalformedEvaluation { .. }));
    }
}
