//! PlanApplier: the serialized arbiter loop.
//!
//! A single task owns the receiving end of the plan queue and handles one
//! plan at a time: snapshot, evaluate, commit, reply. Because nothing else
//! commits allocations, evaluation and commit observe the same allocation
//! state, and arrival order at the queue decides between competing plans.

use std::sync::Arc;

use keelson_scheduler::{PlanError, PlanOutcome};
use keelson_state::{Evaluation, Plan, PlanResult, StateResult, StateSnapshot, StateStore};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::evaluate::evaluate_plan;

/// Default depth of the plan queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Durable storage the arbiter reads from and commits to.
pub trait PlanSink: Send + Sync + 'static {
    /// Snapshot of the latest committed state.
    fn current_snapshot(&self) -> StateResult<StateSnapshot>;

    /// Atomically persist the accepted part of a plan. Returns the state
    /// index the changes became visible at.
    fn commit_plan(&self, result: &PlanResult) -> StateResult<u64>;

    /// Persist an evaluation status update. Returns false if the update was
    /// refused because the evaluation had been cancelled.
    fn update_evaluation(&self, eval: &Evaluation) -> StateResult<bool>;
}

impl PlanSink for StateStore {
    fn current_snapshot(&self) -> StateResult<StateSnapshot> {
        self.snapshot()
    }

    fn commit_plan(&self, result: &PlanResult) -> StateResult<u64> {
        self.commit_plan_result(result)
    }

    fn update_evaluation(&self, eval: &Evaluation) -> StateResult<bool> {
        StateStore::update_evaluation(self, eval)
    }
}

struct PlanRequest {
    plan: Plan,
    reply: oneshot::Sender<Result<PlanOutcome, PlanError>>,
}

/// Submission side of the plan queue. Cheap to clone.
#[derive(Clone)]
pub struct ArbiterHandle {
    tx: mpsc::Sender<PlanRequest>,
}

impl ArbiterHandle {
    /// Enqueue a plan and wait for the arbiter's verdict.
    pub async fn submit(&self, plan: Plan) -> Result<PlanOutcome, PlanError> {
        let (reply, verdict) = oneshot::channel();
        self.tx
            .send(PlanRequest { plan, reply })
            .await
            .map_err(|_| PlanError::ArbiterUnavailable)?;
        verdict.await.map_err(|_| PlanError::ArbiterUnavailable)?
    }

    /// True once the applier has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumes the plan queue and applies plans one at a time.
pub struct PlanApplier<S> {
    sink: Arc<S>,
    rx: mpsc::Receiver<PlanRequest>,
}

impl<S: PlanSink> PlanApplier<S> {
    pub fn new(sink: Arc<S>, queue_depth: usize) -> (Self, ArbiterHandle) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        (Self { sink, rx }, ArbiterHandle { tx })
    }

    /// Start the applier on its own task.
    pub fn spawn(sink: Arc<S>, queue_depth: usize) -> (ArbiterHandle, JoinHandle<()>) {
        let (applier, handle) = Self::new(sink, queue_depth);
        (handle, tokio::spawn(applier.run()))
    }

    /// Apply plans until every [`ArbiterHandle`] has been dropped.
    pub async fn run(mut self) {
        info!("plan applier started");
        while let Some(request) = self.rx.recv().await {
            let plan_id = request.plan.id.clone();
            let verdict = self.apply(&request.plan);
            if let Err(e) = &verdict {
                warn!(%plan_id, error = %e, "plan not applied");
            }
            if request.reply.send(verdict).is_err() {
                debug!(%plan_id, "submitter went away before the verdict");
            }
        }
        info!("plan applier stopped");
    }

    /// Evaluate and commit a single plan.
    pub fn apply(&self, plan: &Plan) -> Result<PlanOutcome, PlanError> {
        let snapshot = self.sink.current_snapshot()?;
        let mut result = evaluate_plan(&snapshot, plan)?;

        if !result.is_no_op() {
            result.alloc_index =
                self.sink
                    .commit_plan(&result)
                    .map_err(|source| PlanError::Commit {
                        plan_id: plan.id.clone(),
                        source,
                    })?;
        }

        let refreshed = if result.is_full_commit() {
            None
        } else {
            Some(self.sink.current_snapshot()?)
        };

        debug!(
            plan_id = %plan.id,
            eval_id = %plan.eval_id,
            accepted = result.accepted_len(),
            rejected = result.rejected.len(),
            alloc_index = result.alloc_index,
            "plan applied"
        );
        Ok(PlanOutcome { result, refreshed })
    }
}
