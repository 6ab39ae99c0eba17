//! keelson-state: cluster state for the Keelson scheduling core.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for nodes, jobs, allocations and evaluations, and the
//! plan/plan-result types exchanged between schedulers and the arbiter.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every write transaction advances a single state index. A
//! [`StateSnapshot`] pins one redb read transaction and therefore one index;
//! its queries return lazy [`ResultCursor`]s that page through a table
//! without materializing it.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod cursor;
pub mod error;
pub mod plan;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use cursor::ResultCursor;
pub use error::{StateError, StateResult};
pub use plan::{Plan, PlanResult, RejectReason, RejectedAllocation};
pub use snapshot::StateSnapshot;
pub use store::{StateStore, group_by_node};
pub use types::*;
