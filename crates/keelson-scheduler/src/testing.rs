//! Test fixtures: cluster builders and a recording planner.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use keelson_state::*;

use crate::error::PlanError;
use crate::scheduler::{PlanOutcome, Planner, PlannerFuture};

pub fn ready_node(id: &str, cpu: u32) -> NodeInfo {
    NodeInfo {
        id: id.to_string(),
        address: "10.0.0.1".to_string(),
        status: NodeStatus::Ready,
        capacity: Resources::new(cpu, 1 << 30),
        labels: HashMap::new(),
        create_index: 0,
        modify_index: 0,
    }
}

/// A `service` job with one task group `g`.
pub fn service_job(id: &str, count: u32, cpu: u32) -> Job {
    Job {
        id: id.to_string(),
        scheduler_type: "service".to_string(),
        priority: 50,
        stopped: false,
        task_groups: vec![TaskGroup {
            name: "g".to_string(),
            count,
            resources: Resources::new(cpu, 0),
            required_labels: HashMap::new(),
            preferred_labels: HashMap::new(),
        }],
        create_index: 0,
        modify_index: 0,
    }
}

/// Store a pending evaluation for `job` and return it as stored.
pub fn stored_eval(store: &StateStore, id: &str, job: &Job) -> Evaluation {
    store
        .put_evaluation(&Evaluation::for_job(id, job, EvalTrigger::JobRegister))
        .unwrap();
    store.get_evaluation(id).unwrap().unwrap()
}

/// Planner that records everything it is given. With a store it accepts
/// and commits every plan unless a rejection has been queued.
#[derive(Default)]
pub struct RecordingPlanner {
    store: Option<StateStore>,
    submitted: Mutex<Vec<Plan>>,
    updates: Mutex<Vec<Evaluation>>,
    rejections: Mutex<VecDeque<RejectReason>>,
    unavailable: AtomicBool,
}

impl RecordingPlanner {
    pub fn committing(store: StateStore) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    /// Reject every change of the next submitted plan.
    pub fn reject_next(&self, reason: RejectReason) {
        self.rejections.lock().unwrap().push_back(reason);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<Plan> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<Evaluation> {
        self.updates.lock().unwrap().clone()
    }

    pub fn last_update(&self) -> Option<Evaluation> {
        self.updates.lock().unwrap().last().cloned()
    }

    fn verdict(&self, plan: Plan) -> Result<PlanOutcome, PlanError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PlanError::ArbiterUnavailable);
        }
        self.submitted.lock().unwrap().push(plan.clone());

        let mut result = PlanResult {
            plan_id: plan.id.clone(),
            eval_id: plan.eval_id.clone(),
            refresh_index: plan.snapshot_index,
            ..PlanResult::default()
        };

        let rejection = self.rejections.lock().unwrap().pop_front();
        if let Some(reason) = rejection {
            result.rejected = plan
                .node_allocation
                .values()
                .chain(plan.node_update.values())
                .flatten()
                .map(|a| RejectedAllocation {
                    alloc_id: a.id.clone(),
                    node_id: a.node_id.clone(),
                    reason,
                })
                .collect();
            let refreshed = match &self.store {
                Some(store) => Some(store.snapshot()?),
                None => None,
            };
            return Ok(PlanOutcome { result, refreshed });
        }

        result.node_allocation = plan.node_allocation;
        result.node_update = plan.node_update;
        if let Some(store) = &self.store {
            result.alloc_index =
                store
                    .commit_plan_result(&result)
                    .map_err(|source| PlanError::Commit {
                        plan_id: plan.id.clone(),
                        source,
                    })?;
        }
        Ok(PlanOutcome {
            result,
            refreshed: None,
        })
    }
}

impl Planner for RecordingPlanner {
    fn submit_plan(&self, plan: Plan) -> PlannerFuture<'_, PlanOutcome> {
        let verdict = self.verdict(plan);
        Box::pin(async move { verdict })
    }

    fn update_eval(&self, eval: Evaluation) -> PlannerFuture<'_, ()> {
        self.updates.lock().unwrap().push(eval.clone());
        let written = match &self.store {
            Some(store) => store
                .update_evaluation(&eval)
                .map(|_| ())
                .map_err(|source| PlanError::EvalUpdate {
                    eval_id: eval.id.clone(),
                    source,
                }),
            None => Ok(()),
        };
        Box::pin(async move { written })
    }

    fn refresh_state(&self) -> PlannerFuture<'_, StateSnapshot> {
        let snapshot = match &self.store {
            Some(store) => store.snapshot().map_err(PlanError::from),
            None => Err(PlanError::ArbiterUnavailable),
        };
        Box::pin(async move { snapshot })
    }
}
