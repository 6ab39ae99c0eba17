//! Scheduler error types.

use keelson_state::{EvalId, PlanId, StateError};
use thiserror::Error;

/// Errors surfaced by a [`Planner`](crate::Planner) implementation.
///
/// Rejections of individual allocations are data (see
/// [`PlanResult::rejected`](keelson_state::PlanResult)), never a `PlanError`.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid plan {plan_id}: {reason}")]
    InvalidPlan { plan_id: PlanId, reason: String },

    #[error("failed to commit plan {plan_id}: {source}")]
    Commit {
        plan_id: PlanId,
        #[source]
        source: StateError,
    },

    #[error("snapshot unavailable: {0}")]
    Snapshot(#[from] StateError),

    #[error("plan arbiter unavailable")]
    ArbiterUnavailable,

    #[error("failed to update evaluation {eval_id}: {source}")]
    EvalUpdate {
        eval_id: EvalId,
        #[source]
        source: StateError,
    },
}

/// Errors that can occur while registering or running schedulers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown scheduler '{0}'")]
    UnknownScheduler(String),

    #[error("scheduler '{0}' already registered")]
    DuplicateScheduler(String),

    #[error("malformed evaluation {eval_id}: {reason}")]
    MalformedEvaluation { eval_id: EvalId, reason: String },

    #[error("state access failed for evaluation {eval_id}: {source}")]
    State {
        eval_id: EvalId,
        #[source]
        source: StateError,
    },

    #[error("plan submission failed for evaluation {eval_id}: {source}")]
    Plan {
        eval_id: EvalId,
        #[source]
        source: PlanError,
    },

    #[error("evaluation {eval_id} exhausted its {attempts} plan attempts")]
    RetriesExhausted { eval_id: EvalId, attempts: u32 },
}

impl SchedulerError {
    /// True for transient infrastructure failures where redelivering the
    /// evaluation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::State { .. } => true,
            Self::Plan { source, .. } => matches!(
                source,
                PlanError::ArbiterUnavailable | PlanError::Snapshot(_) | PlanError::EvalUpdate { .. }
            ),
            _ => false,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
