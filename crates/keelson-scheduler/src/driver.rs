//! The plan/submit/retry loop shared by the builtin schedulers.
//!
//! Each attempt re-derives the work from the current snapshot, so a retry
//! after a partial rejection only proposes what is still missing.

use std::collections::BTreeMap;

use keelson_state::{EvalStatus, Evaluation, Job, Plan, StateError, StateSnapshot};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::retry::RetryState;
use crate::scheduler::Planner;

/// What one attempt wants to change.
#[derive(Debug)]
pub(crate) struct Proposal {
    pub plan: Plan,
    /// Unplaceable allocations per task group.
    pub failed: BTreeMap<String, u32>,
}

/// Computes a proposal from a snapshot. `job` is `None` when the job no
/// longer exists.
pub(crate) type ProposeFn<'a> =
    dyn Fn(&StateSnapshot, &Evaluation, Option<&Job>) -> SchedulerResult<Proposal> + Sync + 'a;

/// Reject evaluations this scheduler cannot process.
pub(crate) fn validate(kind: &str, eval: &Evaluation) -> SchedulerResult<()> {
    let reason = if eval.job_id.is_empty() {
        "missing job id".to_string()
    } else if eval.scheduler_type != kind {
        format!(
            "scheduler type '{}' handed to '{kind}' scheduler",
            eval.scheduler_type
        )
    } else {
        return Ok(());
    };
    Err(SchedulerError::MalformedEvaluation {
        eval_id: eval.id.clone(),
        reason,
    })
}

pub(crate) fn state_err(eval: &Evaluation) -> impl FnOnce(StateError) -> SchedulerError + '_ {
    |source| SchedulerError::State {
        eval_id: eval.id.clone(),
        source,
    }
}

/// Drive `eval` to a terminal status.
pub(crate) async fn drive(
    kind: &'static str,
    state: &mut StateSnapshot,
    planner: &dyn Planner,
    eval: &Evaluation,
    limit: u32,
    propose: &ProposeFn<'_>,
) -> SchedulerResult<()> {
    validate(kind, eval)?;

    let mut retry = RetryState::new(limit);
    let mut failed: BTreeMap<String, u32>;

    loop {
        let Some(attempt) = retry.next_attempt() else {
            return exhausted(planner, eval, &retry).await;
        };

        if let Some(current) = state.evaluation(&eval.id).map_err(state_err(eval))? {
            if current.status == EvalStatus::Cancelled {
                info!(eval_id = %eval.id, attempt, "evaluation cancelled, stopping");
                return Ok(());
            }
        }

        let job = state.job(&eval.job_id).map_err(state_err(eval))?;
        let proposal = propose(&*state, eval, job.as_ref())?;
        failed = proposal.failed;

        if proposal.plan.is_no_op() {
            debug!(eval_id = %eval.id, attempt, "nothing to change");
            break;
        }

        let plan_id = proposal.plan.id.clone();
        debug!(
            eval_id = %eval.id,
            %plan_id,
            attempt,
            changes = proposal.plan.len(),
            snapshot_index = state.index(),
            "submitting plan"
        );
        let outcome = planner
            .submit_plan(proposal.plan)
            .await
            .map_err(|source| SchedulerError::Plan {
                eval_id: eval.id.clone(),
                source,
            })?;

        if outcome.result.is_full_commit() {
            debug!(eval_id = %eval.id, %plan_id, alloc_index = outcome.result.alloc_index, "plan fully committed");
            break;
        }

        warn!(
            eval_id = %eval.id,
            %plan_id,
            accepted = outcome.result.accepted_len(),
            rejected = outcome.result.rejected.len(),
            "plan partially rejected, retrying against refreshed state"
        );
        *state = match outcome.refreshed {
            Some(snapshot) => snapshot,
            None => planner
                .refresh_state()
                .await
                .map_err(|source| SchedulerError::Plan {
                    eval_id: eval.id.clone(),
                    source,
                })?,
        };
    }

    let mut done = eval.clone();
    done.status = EvalStatus::Complete;
    done.attempts = retry.attempts();
    done.status_description = describe_failures(&failed);
    done.failed_placements = failed;
    info!(
        eval_id = %eval.id,
        attempts = done.attempts,
        unplaced = done.failed_placements.values().sum::<u32>(),
        "evaluation complete"
    );
    planner
        .update_eval(done)
        .await
        .map_err(|source| SchedulerError::Plan {
            eval_id: eval.id.clone(),
            source,
        })
}

async fn exhausted(
    planner: &dyn Planner,
    eval: &Evaluation,
    retry: &RetryState,
) -> SchedulerResult<()> {
    let mut failed = eval.clone();
    failed.status = EvalStatus::Failed;
    failed.attempts = retry.attempts();
    failed.status_description = format!("exhausted {} plan attempts", retry.attempts());
    warn!(eval_id = %eval.id, attempts = retry.attempts(), "plan attempts exhausted");

    planner
        .update_eval(failed)
        .await
        .map_err(|source| SchedulerError::Plan {
            eval_id: eval.id.clone(),
            source,
        })?;
    Err(SchedulerError::RetriesExhausted {
        eval_id: eval.id.clone(),
        attempts: retry.attempts(),
    })
}

fn describe_failures(failed: &BTreeMap<String, u32>) -> String {
    if failed.is_empty() {
        return String::new();
    }
    let groups: Vec<String> = failed
        .iter()
        .map(|(group, count)| format!("{group}: {count}"))
        .collect();
    format!(
        "insufficient capacity, unplaced allocations ({})",
        groups.join(", ")
    )
}
