//! ArbiterPlanner: the in-process [`Planner`] backed by the plan applier.

use std::sync::Arc;

use keelson_scheduler::{PlanError, PlanOutcome, Planner, PlannerFuture};
use keelson_state::{Evaluation, Plan, StateSnapshot};
use tracing::debug;

use crate::applier::{ArbiterHandle, PlanSink};

/// Submits plans to the arbiter queue and writes evaluation updates
/// straight to the sink.
pub struct ArbiterPlanner<S> {
    handle: ArbiterHandle,
    sink: Arc<S>,
}

impl<S: PlanSink> ArbiterPlanner<S> {
    pub fn new(handle: ArbiterHandle, sink: Arc<S>) -> Self {
        Self { handle, sink }
    }
}

impl<S: PlanSink> Planner for ArbiterPlanner<S> {
    fn submit_plan(&self, plan: Plan) -> PlannerFuture<'_, PlanOutcome> {
        Box::pin(self.handle.submit(plan))
    }

    fn update_eval(&self, eval: Evaluation) -> PlannerFuture<'_, ()> {
        Box::pin(async move {
            let written = self
                .sink
                .update_evaluation(&eval)
                .map_err(|source| PlanError::EvalUpdate {
                    eval_id: eval.id.clone(),
                    source,
                })?;
            if !written {
                debug!(eval_id = %eval.id, status = ?eval.status, "evaluation was cancelled, update dropped");
            }
            Ok(())
        })
    }

    fn refresh_state(&self) -> PlannerFuture<'_, StateSnapshot> {
        Box::pin(async move { Ok(self.sink.current_snapshot()?) })
    }
}
