//! StateStore: redb-backed state persistence for Keelson.
//!
//! Provides typed CRUD operations over nodes, jobs, allocations and
//! evaluations, plus the atomic plan commit used by the arbiter. All values
//! are JSON-serialized into redb's `&[u8]` value columns. Every write
//! transaction advances a single monotonically increasing state index, which
//! is stamped onto the records it touches and identifies snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::plan::PlanResult;
use crate::snapshot::StateSnapshot;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTableMut<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    index_tx: Arc<watch::Sender<u64>>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, index = store.latest_index()?, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let db = Arc::new(db);
        Self::ensure_tables(&db)?;
        let index = Self::read_index(&db)?;
        let (index_tx, _) = watch::channel(index);
        Ok(Self {
            db,
            index_tx: Arc::new(index_tx),
        })
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(db: &Database) -> StateResult<()> {
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(ALLOCS).map_err(map_err!(Table))?;
        txn.open_table(ALLOC_NODES).map_err(map_err!(Table))?;
        txn.open_table(EVALS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn read_index(db: &Database) -> StateResult<u64> {
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        let index = table
            .get(INDEX_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(index)
    }

    // ── Indexing & snapshots ───────────────────────────────────────

    /// The latest committed state index.
    pub fn latest_index(&self) -> StateResult<u64> {
        Self::read_index(&self.db)
    }

    /// Snapshot of the latest committed state.
    pub fn snapshot(&self) -> StateResult<StateSnapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = {
            let table = txn.open_table(META).map_err(map_err!(Table))?;
            table
                .get(INDEX_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
        };
        Ok(StateSnapshot::new(txn, index))
    }

    /// Snapshot reflecting at least state index `index`, waiting up to
    /// `timeout` for the store to catch up.
    pub async fn snapshot_min_index(
        &self,
        index: u64,
        timeout: Duration,
    ) -> StateResult<StateSnapshot> {
        let mut rx = self.index_tx.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|current| *current >= index))
            .await
            .map(|waited| waited.is_ok());
        match reached {
            Ok(true) => self.snapshot(),
            Ok(false) => Err(StateError::Transaction("state index watch closed".into())),
            Err(_) => {
                let current = self.latest_index()?;
                warn!(wanted = index, current, "timed out waiting for state index");
                Err(StateError::Timeout {
                    wanted: index,
                    current,
                })
            }
        }
    }

    /// Run `f` inside a write transaction that advances the state index.
    ///
    /// `f` receives the index the transaction will commit at. Nothing is
    /// persisted if `f` fails.
    fn write<R>(
        &self,
        f: impl FnOnce(&WriteTransaction, u64) -> StateResult<R>,
    ) -> StateResult<(R, u64)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next = {
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            let current = meta
                .get(INDEX_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            current + 1
        };
        let out = f(&txn, next)?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(INDEX_KEY, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.index_tx.send_replace(next);
        Ok((out, next))
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node. Returns the state index of the write.
    pub fn put_node(&self, node: &NodeInfo) -> StateResult<u64> {
        check_node_id(&node.id).map_err(StateError::InvalidId)?;
        let ((), index) = self.write(|txn, index| {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let existing: Option<NodeInfo> = get_json(&table, &node.id)?;
            let mut node = node.clone();
            node.create_index = existing.map_or(index, |n| n.create_index);
            node.modify_index = index;
            put_json(&mut table, &node.id, &node)
        })?;
        debug!(node_id = %node.id, index, "node stored");
        Ok(index)
    }

    /// Change a node's status, e.g. when it drains or stops heartbeating.
    pub fn update_node_status(&self, node_id: &str, status: NodeStatus) -> StateResult<u64> {
        let ((), index) = self.write(|txn, index| {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node: NodeInfo = get_json(&table, node_id)?
                .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
            node.status = status;
            node.modify_index = index;
            put_json(&mut table, node_id, &node)
        })?;
        debug!(%node_id, ?status, index, "node status updated");
        Ok(index)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        self.snapshot()?.node(node_id)
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeInfo>> {
        self.snapshot()?.nodes()?.collect()
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let (existed, _) = self.write(|txn, _| {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })?;
        debug!(%node_id, existed, "node deleted");
        Ok(existed)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or update a job. Returns the state index of the write.
    pub fn put_job(&self, job: &Job) -> StateResult<u64> {
        let ((), index) = self.write(|txn, index| {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let existing: Option<Job> = get_json(&table, &job.id)?;
            let mut job = job.clone();
            job.create_index = existing.map_or(index, |j| j.create_index);
            job.modify_index = index;
            put_json(&mut table, &job.id, &job)
        })?;
        debug!(job_id = %job.id, index, "job stored");
        Ok(index)
    }

    pub fn get_job(&self, job_id: &str) -> StateResult<Option<Job>> {
        self.snapshot()?.job(job_id)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Insert or update a single allocation outside of plan application,
    /// e.g. to record client-reported status.
    pub fn put_allocation(&self, alloc: &Allocation) -> StateResult<u64> {
        let ((), index) = self.write(|txn, index| {
            let mut allocs = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
            let mut alloc_nodes = txn.open_table(ALLOC_NODES).map_err(map_err!(Table))?;
            upsert_alloc(&mut allocs, &mut alloc_nodes, alloc.clone(), index)
        })?;
        Ok(index)
    }

    /// Record the status a node reports for an allocation.
    pub fn update_alloc_client_status(
        &self,
        alloc_id: &str,
        status: AllocClientStatus,
    ) -> StateResult<u64> {
        let ((), index) = self.write(|txn, index| {
            let mut allocs = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
            let mut alloc_nodes = txn.open_table(ALLOC_NODES).map_err(map_err!(Table))?;
            let mut alloc = lookup_alloc(&allocs, &alloc_nodes, alloc_id)?
                .ok_or_else(|| StateError::NotFound(format!("allocation {alloc_id}")))?;
            alloc.client_status = status;
            upsert_alloc(&mut allocs, &mut alloc_nodes, alloc, index)
        })?;
        debug!(%alloc_id, ?status, index, "allocation client status updated");
        Ok(index)
    }

    pub fn get_allocation(&self, alloc_id: &str) -> StateResult<Option<Allocation>> {
        self.snapshot()?.allocation(alloc_id)
    }

    /// List all allocations on a node.
    pub fn list_allocs_for_node(&self, node_id: &str) -> StateResult<Vec<Allocation>> {
        self.snapshot()?.allocs_by_node(node_id)?.collect()
    }

    /// Commit the accepted portion of a plan in a single write transaction.
    ///
    /// Stops are applied before placements. Before committing, the capacity
    /// of every touched node is re-checked; if any node would be
    /// oversubscribed the whole transaction is abandoned.
    pub fn commit_plan_result(&self, result: &PlanResult) -> StateResult<u64> {
        let ((), index) = self.write(|txn, index| {
            let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut allocs = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
            let mut alloc_nodes = txn.open_table(ALLOC_NODES).map_err(map_err!(Table))?;

            let mut touched: BTreeSet<NodeId> = BTreeSet::new();

            for stop in result.stopped() {
                let mut existing = lookup_alloc(&allocs, &alloc_nodes, &stop.id)?
                    .ok_or_else(|| StateError::NotFound(format!("allocation {}", stop.id)))?;
                existing.desired_status = stop.desired_status;
                existing.desired_description = stop.desired_description.clone();
                if stop.client_status.is_terminal() {
                    existing.client_status = stop.client_status;
                }
                touched.insert(existing.node_id.clone());
                upsert_alloc(&mut allocs, &mut alloc_nodes, existing, index)?;
            }

            for placed in result.placed() {
                let mut alloc = placed.clone();
                alloc.eval_id = result.eval_id.clone();
                touched.insert(alloc.node_id.clone());
                upsert_alloc(&mut allocs, &mut alloc_nodes, alloc, index)?;
            }

            for node_id in &touched {
                let Some(node) = get_json::<NodeInfo>(&nodes, node_id)? else {
                    continue;
                };
                let used = active_usage(&allocs, node_id)?;
                if let Some(dim) = used.exhausted_dimension(&node.capacity) {
                    return Err(StateError::Write(format!(
                        "plan {} would oversubscribe {dim} on node {node_id}",
                        result.plan_id
                    )));
                }
            }
            Ok(())
        })?;
        debug!(
            plan_id = %result.plan_id,
            eval_id = %result.eval_id,
            accepted = result.accepted_len(),
            index,
            "plan result committed"
        );
        Ok(index)
    }

    // ── Evaluations ────────────────────────────────────────────────

    /// Insert or update an evaluation. Returns the state index of the write.
    pub fn put_evaluation(&self, eval: &Evaluation) -> StateResult<u64> {
        let ((), index) = self.write(|txn, index| {
            let mut table = txn.open_table(EVALS).map_err(map_err!(Table))?;
            let existing: Option<Evaluation> = get_json(&table, &eval.id)?;
            let mut eval = eval.clone();
            eval.create_index = existing.map_or(index, |e| e.create_index);
            eval.modify_index = index;
            put_json(&mut table, &eval.id, &eval)
        })?;
        debug!(eval_id = %eval.id, status = ?eval.status, index, "evaluation stored");
        Ok(index)
    }

    pub fn get_evaluation(&self, eval_id: &str) -> StateResult<Option<Evaluation>> {
        self.snapshot()?.evaluation(eval_id)
    }

    /// List all evaluations.
    pub fn list_evaluations(&self) -> StateResult<Vec<Evaluation>> {
        self.snapshot()?.evaluations()?.collect()
    }

    /// Mark a non-terminal evaluation as cancelled. Returns false if the
    /// evaluation had already reached a terminal status.
    pub fn cancel_evaluation(&self, eval_id: &str, reason: &str) -> StateResult<bool> {
        let (cancelled, _) = self.write(|txn, index| {
            let mut table = txn.open_table(EVALS).map_err(map_err!(Table))?;
            let mut eval: Evaluation = get_json(&table, eval_id)?
                .ok_or_else(|| StateError::NotFound(format!("evaluation {eval_id}")))?;
            if eval.status.is_terminal() {
                return Ok(false);
            }
            eval.status = EvalStatus::Cancelled;
            eval.status_description = reason.to_string();
            eval.modify_index = index;
            put_json(&mut table, eval_id, &eval)?;
            Ok(true)
        })?;
        debug!(%eval_id, cancelled, "evaluation cancel requested");
        Ok(cancelled)
    }

    /// Record a scheduler's update to an evaluation.
    ///
    /// A cancellation wins over any later update: if the stored evaluation is
    /// already cancelled nothing is written and `false` is returned.
    pub fn update_evaluation(&self, eval: &Evaluation) -> StateResult<bool> {
        let (written, index) = self.write(|txn, index| {
            let mut table = txn.open_table(EVALS).map_err(map_err!(Table))?;
            let existing: Option<Evaluation> = get_json(&table, &eval.id)?;
            if existing
                .as_ref()
                .is_some_and(|e| e.status == EvalStatus::Cancelled)
            {
                return Ok(false);
            }
            let mut eval = eval.clone();
            eval.create_index = existing.map_or(index, |e| e.create_index);
            eval.modify_index = index;
            put_json(&mut table, &eval.id, &eval)?;
            Ok(true)
        })?;
        debug!(eval_id = %eval.id, status = ?eval.status, written, index, "evaluation updated");
        Ok(written)
    }

    /// Return an in-progress evaluation to the pending queue for redelivery.
    /// Returns false if the evaluation is no longer in progress.
    pub fn requeue_evaluation(&self, eval_id: &str, reason: &str) -> StateResult<bool> {
        let (requeued, _) = self.write(|txn, index| {
            let mut table = txn.open_table(EVALS).map_err(map_err!(Table))?;
            let mut eval: Evaluation = get_json(&table, eval_id)?
                .ok_or_else(|| StateError::NotFound(format!("evaluation {eval_id}")))?;
            if eval.status != EvalStatus::InProgress {
                return Ok(false);
            }
            eval.status = EvalStatus::Pending;
            eval.status_description = reason.to_string();
            eval.modify_index = index;
            put_json(&mut table, eval_id, &eval)?;
            Ok(true)
        })?;
        debug!(%eval_id, requeued, "evaluation requeue requested");
        Ok(requeued)
    }

    /// Return every in-progress evaluation to pending. Run once at startup:
    /// claims held by a previous process have no worker behind them.
    /// Returns the requeued ids in key order.
    pub fn requeue_in_progress_evaluations(&self, reason: &str) -> StateResult<Vec<EvalId>> {
        let stranded = self
            .list_evaluations()?
            .iter()
            .any(|e| e.status == EvalStatus::InProgress);
        if !stranded {
            return Ok(Vec::new());
        }
        let (requeued, index) = self.write(|txn, index| {
            let mut table = txn.open_table(EVALS).map_err(map_err!(Table))?;
            let mut stranded: Vec<Evaluation> = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let eval: Evaluation =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if eval.status == EvalStatus::InProgress {
                    stranded.push(eval);
                }
            }
            let mut ids = Vec::with_capacity(stranded.len());
            for mut eval in stranded {
                eval.status = EvalStatus::Pending;
                eval.status_description = reason.to_string();
                eval.modify_index = index;
                put_json(&mut table, &eval.id, &eval)?;
                ids.push(eval.id);
            }
            Ok(ids)
        })?;
        debug!(count = requeued.len(), index, "requeued in-progress evaluations");
        Ok(requeued)
    }

    /// Atomically move up to `limit` pending evaluations to in-progress and
    /// return them, highest priority first, oldest first within a priority.
    pub fn claim_pending_evaluations(&self, limit: usize) -> StateResult<Vec<Evaluation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // Idle polls must not advance the index.
        let any_pending = self
            .list_evaluations()?
            .iter()
            .any(|e| e.status == EvalStatus::Pending);
        if !any_pending {
            return Ok(Vec::new());
        }
        let (claimed, index) = self.write(|txn, index| {
            let mut table = txn.open_table(EVALS).map_err(map_err!(Table))?;
            let mut pending: Vec<Evaluation> = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let eval: Evaluation =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if eval.status == EvalStatus::Pending {
                    pending.push(eval);
                }
            }
            pending.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.create_index.cmp(&b.create_index))
            });
            pending.truncate(limit);
            for eval in &mut pending {
                eval.status = EvalStatus::InProgress;
                eval.modify_index = index;
                put_json(&mut table, &eval.id, &*eval)?;
            }
            Ok(pending)
        })?;
        if !claimed.is_empty() {
            debug!(count = claimed.len(), index, "claimed pending evaluations");
        }
        Ok(claimed)
    }
}

// ── Transaction helpers ───────────────────────────────────────────

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value: T = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(table: &mut JsonTableMut<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn lookup_alloc(
    allocs: &JsonTableMut<'_>,
    alloc_nodes: &Table<'_, &'static str, &'static str>,
    alloc_id: &str,
) -> StateResult<Option<Allocation>> {
    let node_id = match alloc_nodes.get(alloc_id).map_err(map_err!(Read))? {
        Some(guard) => guard.value().to_string(),
        None => return Ok(None),
    };
    get_json(allocs, &alloc_key(&node_id, alloc_id))
}

/// Write an allocation, keeping the alloc → node index consistent when an
/// allocation changes node.
fn upsert_alloc(
    allocs: &mut JsonTableMut<'_>,
    alloc_nodes: &mut Table<'_, &'static str, &'static str>,
    mut alloc: Allocation,
    index: u64,
) -> StateResult<()> {
    check_node_id(&alloc.node_id).map_err(StateError::InvalidId)?;
    let previous = lookup_alloc(allocs, alloc_nodes, &alloc.id)?;
    if let Some(prev) = &previous {
        if prev.node_id != alloc.node_id {
            allocs
                .remove(prev.table_key().as_str())
                .map_err(map_err!(Write))?;
        }
    }
    alloc.create_index = previous.map_or(index, |p| p.create_index);
    alloc.modify_index = index;
    alloc_nodes
        .insert(alloc.id.as_str(), alloc.node_id.as_str())
        .map_err(map_err!(Write))?;
    put_json(allocs, &alloc.table_key(), &alloc)
}

/// Sum of active reservations on a node, read inside a write transaction.
fn active_usage(allocs: &JsonTableMut<'_>, node_id: &str) -> StateResult<Resources> {
    let prefix = node_alloc_prefix(node_id);
    let mut used = Resources::default();
    for entry in allocs
        .range::<&str>(prefix.as_str()..)
        .map_err(map_err!(Read))?
    {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(&prefix) {
            break;
        }
        let alloc: Allocation =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if alloc.is_active() {
            used = used.add(&alloc.resources);
        }
    }
    Ok(used)
}

/// Group allocations by node, preserving order within a node.
pub fn group_by_node(allocs: impl IntoIterator<Item = Allocation>) -> BTreeMap<NodeId, Vec<Allocation>> {
    let mut grouped: BTreeMap<NodeId, Vec<Allocation>> = BTreeMap::new();
    for alloc in allocs {
        grouped.entry(alloc.node_id.clone()).or_default().push(alloc);
    }
    grouped
}
