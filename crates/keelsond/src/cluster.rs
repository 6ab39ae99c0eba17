//! Cluster description files for `keelsond register`.
//!
//! ```toml
//! [[node]]
//! id = "n1"
//! address = "10.0.0.1"
//! cpu_weight = 1000
//! memory_mb = 4096
//! labels = { zone = "a" }
//!
//! [[job]]
//! id = "web"
//! type = "service"
//!
//! [[job.group]]
//! name = "api"
//! count = 3
//! cpu_weight = 100
//! memory_mb = 256
//! ```

use std::collections::HashMap;
use std::path::Path;

use keelson_state::{
    EvalTrigger, Evaluation, Job, NodeInfo, NodeStatus, Resources, StateStore, TaskGroup,
};
use serde::Deserialize;
use tracing::info;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterFile {
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeEntry>,
    #[serde(default, rename = "job")]
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    #[serde(default)]
    pub address: String,
    pub cpu_weight: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub id: String,
    #[serde(rename = "type", default = "default_type")]
    pub scheduler_type: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default, rename = "group")]
    pub groups: Vec<GroupEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub cpu_weight: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub required_labels: HashMap<String, String>,
    #[serde(default)]
    pub preferred_labels: HashMap<String, String>,
}

fn default_type() -> String {
    "service".to_string()
}

fn default_priority() -> u32 {
    50
}

fn default_count() -> u32 {
    1
}

/// What a registration wrote.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Registered {
    pub nodes: usize,
    pub jobs: usize,
    pub evaluations: Vec<String>,
}

impl ClusterFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Upsert every node and job, creating a pending `job-register`
    /// evaluation per job.
    pub fn register(&self, store: &StateStore) -> anyhow::Result<Registered> {
        let mut registered = Registered::default();

        for entry in &self.nodes {
            store.put_node(&entry.to_node())?;
            registered.nodes += 1;
        }

        for entry in &self.jobs {
            let job = entry.to_job();
            let index = store.put_job(&job)?;
            let eval_id = format!("{}-register-{index}", job.id);
            store.put_evaluation(&Evaluation::for_job(
                eval_id.clone(),
                &job,
                EvalTrigger::JobRegister,
            ))?;
            registered.jobs += 1;
            registered.evaluations.push(eval_id);
        }

        info!(
            nodes = registered.nodes,
            jobs = registered.jobs,
            "cluster file registered"
        );
        Ok(registered)
    }
}

impl NodeEntry {
    fn to_node(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            address: self.address.clone(),
            status: NodeStatus::Ready,
            capacity: Resources::new(self.cpu_weight, self.memory_mb * MIB),
            labels: self.labels.clone(),
            create_index: 0,
            modify_index: 0,
        }
    }
}

impl JobEntry {
    fn to_job(&self) -> Job {
        Job {
            id: self.id.clone(),
            scheduler_type: self.scheduler_type.clone(),
            priority: self.priority,
            stopped: self.stopped,
            task_groups: self
                .groups
                .iter()
                .map(|g| TaskGroup {
                    name: g.name.clone(),
                    count: g.count,
                    resources: Resources::new(g.cpu_weight, g.memory_mb * MIB),
                    required_labels: g.required_labels.clone(),
                    preferred_labels: g.preferred_labels.clone(),
                })
                .collect(),
            create_index: 0,
            modify_index: 0,
        }
    }
}
