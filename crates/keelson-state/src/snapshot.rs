//! StateSnapshot: an immutable, versioned read view of cluster state.
//!
//! A snapshot wraps a redb read transaction. redb is MVCC, so every query
//! against the same snapshot sees the same data no matter what commits
//! happen afterwards. Snapshots are `Clone` (an `Arc` bump) and can be
//! shared freely between tasks.

use std::fmt;
use std::sync::Arc;

use redb::{ReadTransaction, ReadableTable};
use serde::de::DeserializeOwned;

use crate::cursor::{JsonTable, ResultCursor};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Point-in-time view of the state store.
#[derive(Clone)]
pub struct StateSnapshot {
    txn: Arc<ReadTransaction>,
    index: u64,
}

impl StateSnapshot {
    pub(crate) fn new(txn: ReadTransaction, index: u64) -> Self {
        Self {
            txn: Arc::new(txn),
            index,
        }
    }

    /// The state index this snapshot reflects.
    pub fn index(&self) -> u64 {
        self.index
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// All nodes, in id order.
    pub fn nodes(&self) -> StateResult<ResultCursor<NodeInfo>> {
        ResultCursor::open(Arc::clone(&self.txn), NODES, "nodes")
    }

    pub fn node(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        self.get(NODES, node_id)
            .map_err(|e| e.in_query(format!("node {node_id}")))
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn jobs(&self) -> StateResult<ResultCursor<Job>> {
        ResultCursor::open(Arc::clone(&self.txn), JOBS, "jobs")
    }

    pub fn job(&self, job_id: &str) -> StateResult<Option<Job>> {
        self.get(JOBS, job_id)
            .map_err(|e| e.in_query(format!("job {job_id}")))
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Allocations placed on one node (any status).
    pub fn allocs_by_node(&self, node_id: &str) -> StateResult<ResultCursor<Allocation>> {
        Ok(
            ResultCursor::open(Arc::clone(&self.txn), ALLOCS, "allocs_by_node")?
                .with_prefix(node_alloc_prefix(node_id)),
        )
    }

    /// Allocations belonging to one job (any status).
    pub fn allocs_by_job(&self, job_id: &str) -> StateResult<ResultCursor<Allocation>> {
        let job_id = job_id.to_string();
        Ok(
            ResultCursor::open(Arc::clone(&self.txn), ALLOCS, "allocs_by_job")?
                .with_filter(move |a: &Allocation| a.job_id == job_id),
        )
    }

    /// Look up an allocation by id through the alloc → node index.
    pub fn allocation(&self, alloc_id: &str) -> StateResult<Option<Allocation>> {
        let lookup = || -> StateResult<Option<Allocation>> {
            let index = self
                .txn
                .open_table(ALLOC_NODES)
                .map_err(|e| StateError::Table(e.to_string()))?;
            let node_id = match index
                .get(alloc_id)
                .map_err(|e| StateError::Read(e.to_string()))?
            {
                Some(guard) => guard.value().to_string(),
                None => return Ok(None),
            };
            self.get(ALLOCS, &alloc_key(&node_id, alloc_id))
        };
        lookup().map_err(|e| e.in_query(format!("allocation {alloc_id}")))
    }

    /// Sum of active reservations on a node.
    pub fn node_usage(&self, node_id: &str) -> StateResult<Resources> {
        let mut used = Resources::default();
        for alloc in self.allocs_by_node(node_id)? {
            let alloc = alloc?;
            if alloc.is_active() {
                used = used.add(&alloc.resources);
            }
        }
        Ok(used)
    }

    // ── Evaluations ────────────────────────────────────────────────

    pub fn evaluations(&self) -> StateResult<ResultCursor<Evaluation>> {
        ResultCursor::open(Arc::clone(&self.txn), EVALS, "evaluations")
    }

    pub fn evaluation(&self, eval_id: &str) -> StateResult<Option<Evaluation>> {
        self.get(EVALS, eval_id)
            .map_err(|e| e.in_query(format!("evaluation {eval_id}")))
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let table = self
            .txn
            .open_table(table)
            .map_err(|e| StateError::Table(e.to_string()))?;
        match table.get(key).map_err(|e| StateError::Read(e.to_string()))? {
            Some(guard) => {
                let value: T = serde_json::from_slice(guard.value())
                    .map_err(|e| StateError::Deserialize(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSnapshot")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
