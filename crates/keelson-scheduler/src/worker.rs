//! Worker: pulls claimed evaluations off a shared queue and runs the
//! matching scheduler on each, one at a time.

use std::sync::Arc;
use std::time::Duration;

use keelson_state::{EvalStatus, Evaluation, StateStore};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::registry::SchedulerRegistry;
use crate::scheduler::Planner;

/// Receiving side of the evaluation queue, shared by all workers.
pub type EvalQueue = Arc<Mutex<mpsc::Receiver<Evaluation>>>;

/// Tunables for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to wait for the store to reach an evaluation's index.
    pub snapshot_wait: Duration,
    /// Plan attempt budget per evaluation; `None` keeps each scheduler's default.
    pub max_plan_attempts: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            snapshot_wait: Duration::from_secs(5),
            max_plan_attempts: None,
        }
    }
}

/// How a worker disposed of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The scheduler drove the evaluation to a terminal status.
    Processed,
    /// A transient failure; the evaluation is pending again.
    Requeued,
    /// The evaluation ended as failed.
    Failed,
}

pub struct Worker {
    id: usize,
    store: StateStore,
    registry: Arc<SchedulerRegistry>,
    planner: Arc<dyn Planner>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: usize,
        store: StateStore,
        registry: Arc<SchedulerRegistry>,
        planner: Arc<dyn Planner>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            store,
            registry,
            planner,
            config,
        }
    }

    /// Process evaluations until the queue closes.
    pub async fn run(self, queue: EvalQueue) {
        info!(worker = self.id, "worker started");
        loop {
            let next = {
                let mut rx = queue.lock().await;
                rx.recv().await
            };
            let Some(eval) = next else { break };
            let outcome = self.handle(eval).await;
            debug!(worker = self.id, ?outcome, "evaluation handled");
        }
        info!(worker = self.id, "worker stopped");
    }

    /// Process a single evaluation.
    pub async fn handle(&self, eval: Evaluation) -> WorkOutcome {
        debug!(worker = self.id, eval_id = %eval.id, scheduler = %eval.scheduler_type, "processing evaluation");

        let snapshot = match self
            .store
            .snapshot_min_index(eval.modify_index, self.config.snapshot_wait)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(worker = self.id, eval_id = %eval.id, error = %e, "state not caught up");
                return self.requeue(&eval, &e.to_string());
            }
        };

        let mut scheduler = match self.registry.instantiate(
            &eval.scheduler_type,
            snapshot,
            Arc::clone(&self.planner),
        ) {
            Ok(scheduler) => scheduler,
            Err(e) => return self.fail(&eval, &e),
        };
        if let Some(attempts) = self.config.max_plan_attempts {
            scheduler.set_retry_limit(attempts);
        }

        match scheduler.process(&eval).await {
            Ok(()) => WorkOutcome::Processed,
            Err(e @ SchedulerError::RetriesExhausted { .. }) => {
                warn!(worker = self.id, eval_id = %eval.id, error = %e, "evaluation failed");
                WorkOutcome::Failed
            }
            Err(e) if e.is_retryable() => {
                warn!(worker = self.id, eval_id = %eval.id, error = %e, "retryable scheduling error");
                self.requeue(&eval, &e.to_string())
            }
            Err(e) => self.fail(&eval, &e),
        }
    }

    fn requeue(&self, eval: &Evaluation, reason: &str) -> WorkOutcome {
        match self.store.requeue_evaluation(&eval.id, reason) {
            Ok(_) => WorkOutcome::Requeued,
            Err(e) => {
                error!(worker = self.id, eval_id = %eval.id, error = %e, "failed to requeue evaluation");
                WorkOutcome::Failed
            }
        }
    }

    fn fail(&self, eval: &Evaluation, err: &SchedulerError) -> WorkOutcome {
        error!(worker = self.id, eval_id = %eval.id, error = %err, "evaluation failed");
        let mut failed = eval.clone();
        failed.status = EvalStatus::Failed;
        failed.status_description = err.to_string();
        if let Err(e) = self.store.update_evaluation(&failed) {
            error!(worker = self.id, eval_id = %eval.id, error = %e, "failed to record evaluation failure");
        }
        WorkOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn worker(store: &StateStore, planner: Arc<RecordingPlanner>) -> Worker {
        Worker::new(
            0,
            store.clone(),
            Arc::new(SchedulerRegistry::with_builtins()),
            planner,
            WorkerConfig {
                snapshot_wait: Duration::from_millis(100),
                max_plan_attempts: Some(3),
            },
        )
    }

    #[tokio::test]
    async fn processes_claimed_evaluation() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let job = service_job("web", 2, 2);
        store.put_job(&job).unwrap();
        stored_eval(&store, "e1", &job);
        let eval = store.claim_pending_evaluations(1).unwrap().remove(0);

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        let outcome = worker(&store, planner).handle(eval).await;

        assert_eq!(outcome, WorkOutcome::Processed);
        let stored = store.get_evaluation("e1").unwrap().unwrap();
        assert_eq!(stored.status, EvalStatus::Complete);
    }

    #[tokio::test]
    async fn unknown_scheduler_fails_evaluation() {
        let store = StateStore::open_in_memory().unwrap();
        let mut job = service_job("web", 1, 1);
        job.scheduler_type = "gpu".to_string();
        stored_eval(&store, "e1", &job);
        let eval = store.claim_pending_evaluations(1).unwrap().remove(0);

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        let outcome = worker(&store, planner).handle(eval).await;

        assert_eq!(outcome, WorkOutcome::Failed);
        let stored = store.get_evaluation("e1").unwrap().unwrap();
        assert_eq!(stored.status, EvalStatus::Failed);
        assert!(stored.status_description.contains("unknown scheduler 'gpu'"));
    }

    #[tokio::test]
    async fn unavailable_arbiter_requeues() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let job = service_job("web", 1, 1);
        store.put_job(&job).unwrap();
        stored_eval(&store, "e1", &job);
        let eval = store.claim_pending_evaluations(1).unwrap().remove(0);

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        planner.set_unavailable(true);
        let outcome = worker(&store, planner).handle(eval).await;

        assert_eq!(outcome, WorkOutcome::Requeued);
        let stored = store.get_evaluation("e1").unwrap().unwrap();
        assert_eq!(stored.status, EvalStatus::Pending);
    }

    #[tokio::test]
    async fn future_index_times_out_and_requeues() {
        let store = StateStore::open_in_memory().unwrap();
        let job = service_job("web", 1, 1);
        stored_eval(&store, "e1", &job);
        let mut eval = store.claim_pending_evaluations(1).unwrap().remove(0);
        eval.modify_index = 1_000;

        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        let outcome = worker(&store, planner.clone()).handle(eval).await;

        assert_eq!(outcome, WorkOutcome::Requeued);
        assert!(planner.submitted().is_empty());
    }

    #[tokio::test]
    async fn run_drains_queue_until_closed() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&ready_node("n1", 10)).unwrap();
        let job = service_job("web", 1, 1);
        store.put_job(&job).unwrap();
        stored_eval(&store, "e1", &job);
        let eval = store.claim_pending_evaluations(1).unwrap().remove(0);

        let (tx, rx) = mpsc::channel(4);
        let queue: EvalQueue = Arc::new(Mutex::new(rx));
        let planner = Arc::new(RecordingPlanner::committing(store.clone()));
        let handle = tokio::spawn(worker(&store, planner).run(queue));

        tx.send(eval).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            store.get_evaluation("e1").unwrap().unwrap().status,
            EvalStatus::Complete
        );
    }
}
