//! Domain types for the Keelson state store.
//!
//! These types represent the persisted state of nodes, jobs, allocations and
//! evaluations. All types are serializable to/from JSON for storage in redb
//! tables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a job.
pub type JobId = String;

/// Unique identifier for an allocation.
pub type AllocId = String;

/// Unique identifier for an evaluation.
pub type EvalId = String;

/// Unique identifier for a submitted plan.
pub type PlanId = String;

// ── Resources ─────────────────────────────────────────────────────

/// A quantity of schedulable resources: node capacity or a reservation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU weight (relative, higher = more CPU time).
    pub cpu_weight: u32,
    /// Memory in bytes.
    pub memory_bytes: u64,
}

impl Resources {
    pub const fn new(cpu_weight: u32, memory_bytes: u64) -> Self {
        Self {
            cpu_weight,
            memory_bytes,
        }
    }

    /// Component-wise sum, saturating at the type maximum.
    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_weight: self.cpu_weight.saturating_add(other.cpu_weight),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    /// Component-wise difference, clamped at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_weight: self.cpu_weight.saturating_sub(other.cpu_weight),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }

    /// True if every component of `self` is within `capacity`.
    pub fn fits_within(&self, capacity: &Resources) -> bool {
        self.cpu_weight <= capacity.cpu_weight && self.memory_bytes <= capacity.memory_bytes
    }

    /// Name of the first dimension on which `self` exceeds `capacity`.
    pub fn exhausted_dimension(&self, capacity: &Resources) -> Option<&'static str> {
        if self.cpu_weight > capacity.cpu_weight {
            Some("cpu")
        } else if self.memory_bytes > capacity.memory_bytes {
            Some("memory")
        } else {
            None
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Scheduling status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    Draining,
    Down,
}

/// Information about a node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub status: NodeStatus,
    /// Total schedulable resources on this node.
    pub capacity: Resources,
    /// Arbitrary labels for constraints and affinity.
    pub labels: HashMap<String, String>,
    /// State index at which this node was first written.
    #[serde(default)]
    pub create_index: u64,
    /// State index of the last write to this node.
    #[serde(default)]
    pub modify_index: u64,
}

impl NodeInfo {
    /// Whether new allocations may be placed on this node.
    pub fn is_eligible(&self) -> bool {
        self.status == NodeStatus::Ready
    }
}

// ── Job ───────────────────────────────────────────────────────────

/// A workload definition the schedulers reconcile towards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    /// Name of the scheduler that handles evaluations for this job.
    pub scheduler_type: String,
    pub priority: u32,
    /// A stopped job should have no running allocations.
    #[serde(default)]
    pub stopped: bool,
    pub task_groups: Vec<TaskGroup>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// A group of identical allocations within a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskGroup {
    pub name: String,
    /// Desired number of allocations (ignored by the system scheduler).
    pub count: u32,
    /// Reservation per allocation.
    pub resources: Resources,
    /// Labels a node must carry to be feasible.
    #[serde(default)]
    pub required_labels: HashMap<String, String>,
    /// Labels that raise a node's score.
    #[serde(default)]
    pub preferred_labels: HashMap<String, String>,
}

impl Job {
    pub fn task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }
}

// ── Allocation ────────────────────────────────────────────────────

/// What the scheduler wants an allocation to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDesiredStatus {
    Run,
    Stop,
    Evict,
}

/// What the node reports an allocation is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl AllocClientStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AllocClientStatus::Complete | AllocClientStatus::Failed | AllocClientStatus::Lost
        )
    }
}

/// A binding of one task group instance to one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub id: AllocId,
    /// Stable slot name, `{job}.{group}[{index}]`.
    pub name: String,
    pub node_id: NodeId,
    /// Evaluation that produced this allocation.
    pub eval_id: EvalId,
    pub job_id: JobId,
    pub task_group: String,
    /// Resources reserved on the node.
    pub resources: Resources,
    pub desired_status: AllocDesiredStatus,
    #[serde(default)]
    pub desired_description: String,
    pub client_status: AllocClientStatus,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Allocation {
    /// Whether this allocation's reservation counts against its node.
    pub fn is_active(&self) -> bool {
        self.desired_status == AllocDesiredStatus::Run && !self.client_status.is_terminal()
    }

    /// Build the composite key for the allocations table.
    pub fn table_key(&self) -> String {
        alloc_key(&self.node_id, &self.id)
    }

    /// Slot index parsed from the allocation name, if well-formed.
    pub fn name_index(&self) -> Option<u32> {
        let open = self.name.rfind('[')?;
        let close = self.name.rfind(']')?;
        self.name.get(open + 1..close)?.parse().ok()
    }
}

/// Separator of composite table keys. Node ids may not contain it.
pub const KEY_SEPARATOR: char = '/';

/// Composite allocations-table key.
pub fn alloc_key(node_id: &str, alloc_id: &str) -> String {
    format!("{node_id}{KEY_SEPARATOR}{alloc_id}")
}

/// Key prefix shared by every allocation on `node_id`.
pub fn node_alloc_prefix(node_id: &str) -> String {
    format!("{node_id}{KEY_SEPARATOR}")
}

/// Reject node ids that would break the `{node_id}/{alloc_id}` key scheme.
pub fn check_node_id(node_id: &str) -> Result<(), String> {
    if node_id.is_empty() {
        return Err("node id is empty".to_string());
    }
    if node_id.contains(KEY_SEPARATOR) {
        return Err(format!("node id '{node_id}' contains '{KEY_SEPARATOR}'"));
    }
    Ok(())
}

/// Slot name for the `index`-th allocation of a task group.
pub fn alloc_name(job_id: &str, group: &str, index: u32) -> String {
    format!("{job_id}.{group}[{index}]")
}

// ── Evaluation ────────────────────────────────────────────────────

/// Lifecycle status of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl EvalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Cancelled
        )
    }
}

/// What caused an evaluation to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalTrigger {
    JobRegister,
    JobDeregister,
    NodeUpdate,
    AllocFailure,
    Manual,
}

/// A unit of scheduling work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub id: EvalId,
    /// Name of the scheduler that must process this evaluation.
    pub scheduler_type: String,
    pub job_id: JobId,
    pub priority: u32,
    pub triggered_by: EvalTrigger,
    pub status: EvalStatus,
    #[serde(default)]
    pub status_description: String,
    /// Task group → allocations that could not be placed.
    #[serde(default)]
    pub failed_placements: BTreeMap<String, u32>,
    /// Number of plan submissions made while processing.
    #[serde(default)]
    pub attempts: u32,
    /// State index at creation; orders evaluations of equal priority.
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Evaluation {
    /// A fresh pending evaluation for a job.
    pub fn for_job(id: impl Into<EvalId>, job: &Job, triggered_by: EvalTrigger) -> Self {
        Evaluation {
            id: id.into(),
            scheduler_type: job.scheduler_type.clone(),
            job_id: job.id.clone(),
            priority: job.priority,
            triggered_by,
            status: EvalStatus::Pending,
            status_description: String::new(),
            failed_placements: BTreeMap::new(),
            attempts: 0,
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn terminal_status(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(desired: AllocDesiredStatus, client: AllocClientStatus) -> Allocation {
        Allocation {
            id: "a1".to_string(),
            name: alloc_name("web", "api", 3),
            node_id: "n1".to_string(),
            eval_id: "e1".to_string(),
            job_id: "web".to_string(),
            task_group: "api".to_string(),
            resources: Resources::new(100, 256),
            desired_status: desired,
            desired_description: String::new(),
            client_status: client,
            create_index: 1,
            modify_index: 1,
        }
    }

    #[test]
    fn resources_fit_and_exhaustion() {
        let cap = Resources::new(1000, 1024);
        assert!(Resources::new(1000, 1024).fits_within(&cap));
        assert_eq!(Resources::new(1001, 1).exhausted_dimension(&cap), Some("cpu"));
        assert_eq!(Resources::new(1, 2048).exhausted_dimension(&cap), Some("memory"));
        assert_eq!(Resources::new(1, 1).exhausted_dimension(&cap), None);
    }

    #[test]
    fn resources_arithmetic_saturates() {
        let a = Resources::new(u32::MAX, 10);
        assert_eq!(a.add(&Resources::new(1, 5)), Resources::new(u32::MAX, 15));
        assert_eq!(
            Resources::new(5, 5).saturating_sub(&Resources::new(10, 1)),
            Resources::new(0, 4)
        );
    }

    #[test]
    fn allocation_activity() {
        assert!(alloc(AllocDesiredStatus::Run, AllocClientStatus::Running).is_active());
        assert!(alloc(AllocDesiredStatus::Run, AllocClientStatus::Pending).is_active());
        assert!(!alloc(AllocDesiredStatus::Stop, AllocClientStatus::Running).is_active());
        assert!(!alloc(AllocDesiredStatus::Run, AllocClientStatus::Lost).is_active());
    }

    #[test]
    fn allocation_name_index() {
        let a = alloc(AllocDesiredStatus::Run, AllocClientStatus::Running);
        assert_eq!(a.name, "web.api[3]");
        assert_eq!(a.name_index(), Some(3));
        assert_eq!(a.table_key(), "n1/a1");
    }

    #[test]
    fn node_ids_are_checked_against_the_separator() {
        assert!(check_node_id("n1").is_ok());
        assert!(check_node_id("").is_err());
        let err = check_node_id("rack/n1").unwrap_err();
        assert!(err.contains("rack/n1"));
        assert_eq!(node_alloc_prefix("rack"), "rack/");
        assert!(!alloc_key("rack", "a1").starts_with(&node_alloc_prefix("rac")));
    }

    #[test]
    fn eval_status_serializes_kebab_case() {
        let json = serde_json::to_string(&EvalStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        assert!(EvalStatus::Cancelled.is_terminal());
        assert!(!EvalStatus::Pending.is_terminal());
    }
}
