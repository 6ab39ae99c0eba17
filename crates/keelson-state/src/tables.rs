//! redb table definitions for the Keelson state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}/{child_id}`.

use redb::TableDefinition;

/// Node info keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Job specs keyed by `{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Allocations keyed by `{node_id}/{alloc_id}` so a node's allocations are
/// one contiguous range.
pub const ALLOCS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocs");

/// Secondary index: `{alloc_id}` → `{node_id}`.
pub const ALLOC_NODES: TableDefinition<&str, &str> = TableDefinition::new("alloc_nodes");

/// Evaluations keyed by `{eval_id}`.
pub const EVALS: TableDefinition<&str, &[u8]> = TableDefinition::new("evals");

/// Store metadata (currently only the state index).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the latest committed state index.
pub const INDEX_KEY: &str = "index";
