//! Persisted entity types.
//!
//! Every record returned by the store is a snapshot; callers mutate a copy
//! and write it back through a [`WriteTx`](crate::WriteTx).

use std::collections::BTreeMap;
use std::fmt;

use peerlab_query::Labeled;
use serde::{Deserialize, Serialize};

/// Sort and de-duplicate a label set in place.
pub fn normalize_labels(labels: &mut Vec<String>) {
    labels.sort();
    labels.dedup();
}

/// Add `adds`, then drop `removes`, leaving the set sorted and unique.
///
/// Applying the same pair twice yields the same set as applying it once.
pub fn apply_labels(labels: &mut Vec<String>, adds: &[String], removes: &[String]) {
    labels.extend(adds.iter().cloned());
    labels.retain(|l| !removes.contains(l));
    normalize_labels(labels);
}

macro_rules! impl_labeled {
    ($($ty:ty),*) => {
        $(impl Labeled for $ty {
            fn id(&self) -> &str {
                &self.id
            }

            fn labels(&self) -> &[String] {
                &self.labels
            }
        })*
    };
}

impl_labeled!(Cluster, Node, Scenario, Benchmark, Experiment);

// ── Cluster ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Creating,
    Connecting,
    Created,
    Destroying,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Creating => "creating",
            ClusterStatus::Connecting => "connecting",
            ClusterStatus::Created => "created",
            ClusterStatus::Destroying => "destroying",
        };
        f.write_str(s)
    }
}

/// One homogeneous group of nodes within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterGroup {
    pub size: usize,
    pub instance_type: String,
    pub region: String,
    /// Extra labels given to every node of the group.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl ClusterGroup {
    /// Labels derived from the group's shape.
    pub fn generate_labels(&self) -> Vec<String> {
        vec![
            format!("instance_type={}", self.instance_type),
            format!("region={}", self.region),
        ]
    }
}

/// What a cluster should look like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterDefinition {
    Groups { groups: Vec<ClusterGroup> },
    /// An opaque definition the provider resolves by name.
    Reference { name: String },
}

impl ClusterDefinition {
    /// Shape labels across all groups, sorted and unique.
    pub fn generate_labels(&self) -> Vec<String> {
        let mut labels = match self {
            ClusterDefinition::Groups { groups } => {
                groups.iter().flat_map(ClusterGroup::generate_labels).collect()
            }
            ClusterDefinition::Reference { .. } => Vec::new(),
        };
        normalize_labels(&mut labels);
        labels
    }

    /// Total node count, if known without asking the provider.
    pub fn size(&self) -> Option<usize> {
        match self {
            ClusterDefinition::Groups { groups } => Some(groups.iter().map(|g| g.size).sum()),
            ClusterDefinition::Reference { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub status: ClusterStatus,
    pub definition: ClusterDefinition,
    pub labels: Vec<String>,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last write.
    pub updated_at: u64,
}

impl Cluster {
    /// A fresh `Creating` record labeled with its id and shape.
    pub fn new(id: impl Into<String>, definition: ClusterDefinition) -> Self {
        let id = id.into();
        let mut labels = definition.generate_labels();
        labels.push(id.clone());
        normalize_labels(&mut labels);
        Self {
            id,
            status: ClusterStatus::Creating,
            definition,
            labels,
            created_at: 0,
            updated_at: 0,
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// A raw node as reported by a provider, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    /// Host the node agent is reachable on.
    pub address: String,
    pub agent_port: u16,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub cluster_id: String,
    pub address: String,
    pub agent_port: u16,
    pub labels: Vec<String>,
    pub health: NodeHealth,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    pub fn from_descriptor(cluster_id: &str, desc: &NodeDescriptor) -> Self {
        let mut labels = desc.labels.clone();
        labels.push(desc.id.clone());
        normalize_labels(&mut labels);
        Self {
            id: desc.id.clone(),
            cluster_id: cluster_id.to_string(),
            address: desc.address.clone(),
            agent_port: desc.agent_port,
            labels,
            health: NodeHealth::Unknown,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Base URL of the node's agent.
    pub fn agent_url(&self) -> String {
        format!("http://{}:{}", self.address, self.agent_port)
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.id.clone(),
            address: self.address.clone(),
            agent_port: self.agent_port,
            labels: self.labels.clone(),
        }
    }
}

// ── Scenario ──────────────────────────────────────────────────────

/// A piece of content a scenario distributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDefinition {
    /// Content kind, e.g. `oci` or `file`.
    pub kind: String,
    pub source: String,
}

/// Workload description: which objects exist, which nodes seed them, and
/// which nodes fetch them during the benchmark. `seed` and `benchmark` map
/// a node query to an object name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    #[serde(default)]
    pub objects: BTreeMap<String, ObjectDefinition>,
    #[serde(default)]
    pub seed: BTreeMap<String, String>,
    #[serde(default)]
    pub benchmark: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub definition: ScenarioDefinition,
    pub labels: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Scenario {
    pub fn new(id: impl Into<String>, definition: ScenarioDefinition) -> Self {
        let id = id.into();
        Self {
            labels: vec![id.clone()],
            id,
            definition,
            created_at: 0,
            updated_at: 0,
        }
    }
}

// ── Plan ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Dial the comma-joined peer addresses in the subject.
    Connect,
    /// Drop connections to the peers in the subject.
    Disconnect,
    /// Fetch the content named by the subject.
    Get,
    /// Refresh the agent's own software; subject is unused.
    Update,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::Connect => "connect",
            TaskKind::Disconnect => "disconnect",
            TaskKind::Get => "get",
            TaskKind::Update => "update",
        };
        f.write_str(s)
    }
}

/// One unit of work for a node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub subject: String,
}

impl Task {
    pub fn new(kind: TaskKind, subject: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
        }
    }
}

/// Concrete execution plan. Both phase maps are keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Object name to resolved content reference.
    pub objects: BTreeMap<String, String>,
    pub seed: BTreeMap<String, Vec<Task>>,
    pub benchmark: BTreeMap<String, Vec<Task>>,
}

// ── Benchmark ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkStatus {
    Running,
    Done,
    Error,
}

impl BenchmarkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BenchmarkStatus::Done | BenchmarkStatus::Error)
    }
}

impl fmt::Display for BenchmarkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BenchmarkStatus::Running => "running",
            BenchmarkStatus::Done => "done",
            BenchmarkStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One execution of a scenario. `cluster` and `scenario` are snapshots
/// taken at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: String,
    pub status: BenchmarkStatus,
    pub cluster: Cluster,
    pub scenario: Scenario,
    pub plan: Plan,
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Benchmark {
    /// A `Running` record labeled with the cluster, scenario and its own id.
    pub fn new(id: impl Into<String>, cluster: Cluster, scenario: Scenario, plan: Plan) -> Self {
        let id = id.into();
        let mut labels = vec![cluster.id.clone(), scenario.id.clone(), id.clone()];
        normalize_labels(&mut labels);
        Self {
            id,
            status: BenchmarkStatus::Running,
            cluster,
            scenario,
            plan,
            labels,
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}

// ── Report ────────────────────────────────────────────────────────

/// Transfer counters reported by a node agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub blocks_received: u64,
    pub data_received: u64,
    pub dup_blocks_received: u64,
    pub dup_data_received: u64,
}

impl TransferStats {
    pub fn accumulate(&mut self, other: &TransferStats) {
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.blocks_received += other.blocks_received;
        self.data_received += other.data_received;
        self.dup_blocks_received += other.dup_blocks_received;
        self.dup_data_received += other.dup_data_received;
    }
}

/// What one node did during the benchmark phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTrace {
    /// Unix timestamp (milliseconds) the node's first task was sent.
    pub start_ms: u64,
    pub end_ms: u64,
    /// Tasks the node completed.
    pub tasks: usize,
    pub stats: TransferStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeTrace {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_time_ms: u64,
    /// Trace id of the run, or a link to it in the trace UI.
    pub trace: String,
    #[serde(default)]
    pub failed_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Statistics computed over every node trace of a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    pub nodes: usize,
    pub failed: usize,
    pub totals: TransferStats,
    pub avg_bytes_in: f64,
    pub avg_bytes_out: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub mean_duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub benchmark_id: String,
    pub summary: ReportSummary,
    /// Per-node traces keyed by node id.
    pub nodes: BTreeMap<String, NodeTrace>,
    /// Query text to the node ids it selected.
    pub queries: BTreeMap<String, Vec<String>>,
    pub aggregates: Aggregates,
}

// ── Experiment ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    Done,
    Error,
}

impl ExperimentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExperimentStatus::Done | ExperimentStatus::Error)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExperimentStatus::Running => "running",
            ExperimentStatus::Done => "done",
            ExperimentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One (cluster, scenario) pairing within an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialDefinition {
    pub cluster: ClusterDefinition,
    pub scenario: ScenarioDefinition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub trials: Vec<TrialDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub status: ExperimentStatus,
    pub definition: ExperimentDefinition,
    pub labels: Vec<String>,
    /// Ids of the trial benchmarks, in trial order. Reports are stored
    /// once, under their benchmark id, and read through
    /// `/benchmarks/{id}/report/json`.
    #[serde(default)]
    pub benchmarks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Experiment {
    pub fn new(id: impl Into<String>, definition: ExperimentDefinition) -> Self {
        let id = id.into();
        Self {
            labels: vec![id.clone()],
            id,
            status: ExperimentStatus::Running,
            definition,
            benchmarks: Vec::new(),
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}
