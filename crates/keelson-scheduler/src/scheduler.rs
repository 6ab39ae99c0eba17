//! The scheduler and planner contracts.
//!
//! A [`Scheduler`] processes one evaluation at a time against a
//! [`StateSnapshot`], proposing allocation changes as a [`Plan`]. Plans are
//! handed to a [`Planner`], which returns the arbiter's verdict and, when
//! anything was rejected, a newer snapshot to retry against.
//!
//! Both traits use boxed futures so they stay object safe: the registry
//! hands out `Box<dyn Scheduler>` and schedulers hold `Arc<dyn Planner>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use keelson_state::{Evaluation, Plan, PlanResult, StateSnapshot};

use crate::error::{PlanError, SchedulerResult};

/// Future returned by [`Scheduler::process`].
pub type ProcessFuture<'a> = Pin<Box<dyn Future<Output = SchedulerResult<()>> + Send + 'a>>;

/// Future returned by [`Planner`] operations.
pub type PlannerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PlanError>> + Send + 'a>>;

/// Constructs a scheduler bound to an initial snapshot and a planner.
/// Construction does no I/O.
pub type Factory = fn(StateSnapshot, Arc<dyn Planner>) -> Box<dyn Scheduler>;

/// Business logic for turning an evaluation into allocation changes.
pub trait Scheduler: Send {
    /// Process one evaluation to completion.
    ///
    /// Returns `Ok` when the evaluation reached a terminal status (including
    /// cancellation and partial infeasibility). Errors are reserved for
    /// malformed evaluations, state access failures, submission failures and
    /// an exhausted retry budget.
    fn process<'a>(&'a mut self, eval: &'a Evaluation) -> ProcessFuture<'a>;

    /// Override how many plans one evaluation may submit.
    fn set_retry_limit(&mut self, _attempts: u32) {}
}

/// The arbiter's answer to a submitted plan.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub result: PlanResult,
    /// Post-commit snapshot, present whenever something was rejected.
    pub refreshed: Option<StateSnapshot>,
}

/// The scheduler's only path to mutating cluster state.
pub trait Planner: Send + Sync {
    /// Submit a plan for arbitration and wait for the verdict.
    fn submit_plan(&self, plan: Plan) -> PlannerFuture<'_, PlanOutcome>;

    /// Record a status change of the evaluation being processed.
    fn update_eval(&self, eval: Evaluation) -> PlannerFuture<'_, ()>;

    /// A snapshot of the latest committed state.
    fn refresh_state(&self) -> PlannerFuture<'_, StateSnapshot>;
}
