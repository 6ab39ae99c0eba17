//! keelson-scheduler: scheduler contracts, registry and builtin schedulers.
//!
//! A scheduler turns one evaluation into allocation changes. It reads an
//! immutable [`StateSnapshot`](keelson_state::StateSnapshot), proposes a
//! [`Plan`](keelson_state::Plan), and submits it through a [`Planner`]. The
//! planner decides what actually commits; on rejection the scheduler retries
//! against newer state within a bounded budget.
//!
//! # Architecture
//!
//! ```text
//! Worker (one evaluation at a time)
//!   ├── SchedulerRegistry::instantiate(type, snapshot, planner)
//!   └── Box<dyn Scheduler>::process(eval)
//!         ├── propose from snapshot (keelson-placement)
//!         ├── Planner::submit_plan → PlanOutcome
//!         ├── retry on rejection (RetryState)
//!         └── Planner::update_eval (terminal status)
//! ```

mod driver;
pub mod error;
pub mod generic;
pub mod ids;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod system;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{PlanError, SchedulerError, SchedulerResult};
pub use generic::GenericScheduler;
pub use registry::{BATCH, SERVICE, SYSTEM, SchedulerRegistry};
pub use retry::RetryState;
pub use scheduler::{Factory, PlanOutcome, Planner, PlannerFuture, ProcessFuture, Scheduler};
pub use system::SystemScheduler;
pub use worker::{EvalQueue, WorkOutcome, Worker, WorkerConfig};
