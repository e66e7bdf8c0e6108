//! Scriptable provider and agents for tests.
//!
//! Enabled inside this crate's tests and, for downstream crates, through
//! the `testing` feature.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use peerlab_core::{BoxFuture, LabError, LabResult, ensure_active};
use peerlab_state::{ClusterDefinition, Node, NodeDescriptor, Task, TaskKind, TransferStats};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentConnector, NodeAgent, PeerInfo, TaskOutcome};
use crate::provider::{NodeGroup, NodeProvider, group_node_labels};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Provider ──────────────────────────────────────────────────────

#[derive(Default)]
struct ProviderState {
    fail_create: bool,
    fail_destroy: bool,
    created: Vec<String>,
    destroyed: Vec<NodeGroup>,
}

/// Provider that fabricates node descriptors without starting anything.
///
/// Nodes are named `{cluster_id}-{index}`; a reference definition yields
/// a single node.
#[derive(Clone, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self) {
        lock(&self.state).fail_create = true;
    }

    pub fn fail_destroy(&self) {
        lock(&self.state).fail_destroy = true;
    }

    /// Cluster ids passed to successful create calls.
    pub fn created(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    /// Groups passed to successful destroy calls.
    pub fn destroyed(&self) -> Vec<NodeGroup> {
        lock(&self.state).destroyed.clone()
    }
}

impl NodeProvider for FakeProvider {
    fn create_node_group<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        cluster_id: &'a str,
        definition: &'a ClusterDefinition,
    ) -> BoxFuture<'a, LabResult<NodeGroup>> {
        Box::pin(async move {
            ensure_active(cancel)?;
            let mut state = lock(&self.state);
            if state.fail_create {
                return Err(LabError::Unavailable(format!("provision {cluster_id}: quota exceeded")));
            }

            let shapes: Vec<Vec<String>> = match definition {
                ClusterDefinition::Groups { groups } => groups
                    .iter()
                    .flat_map(|g| std::iter::repeat_n(group_node_labels(g), g.size))
                    .collect(),
                ClusterDefinition::Reference { .. } => vec![Vec::new()],
            };
            let nodes = shapes
                .into_iter()
                .enumerate()
                .map(|(i, labels)| NodeDescriptor {
                    id: format!("{cluster_id}-{i}"),
                    address: "127.0.0.1".to_string(),
                    agent_port: 0,
                    labels,
                })
                .collect();

            state.created.push(cluster_id.to_string());
            Ok(NodeGroup {
                cluster_id: cluster_id.to_string(),
                nodes,
            })
        })
    }

    fn destroy_node_group<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        group: &'a NodeGroup,
    ) -> BoxFuture<'a, LabResult<()>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.fail_destroy {
                return Err(LabError::Unavailable(format!(
                    "destroy {}: provider unreachable",
                    group.cluster_id
                )));
            }
            state.destroyed.push(group.clone());
            Ok(())
        })
    }
}

// ── Agents ────────────────────────────────────────────────────────

#[derive(Default)]
struct AgentScript {
    fail_peer_info: HashSet<String>,
    zero_addrs: HashSet<String>,
    fail_health: HashSet<String>,
    fail_task: HashSet<(String, TaskKind)>,
    block_task: HashSet<(String, TaskKind)>,
    stats: HashMap<String, TransferStats>,
    tasks: HashMap<String, Vec<Task>>,
    health_checks: HashMap<String, usize>,
}

/// Connector handing out in-memory agents that share one script.
#[derive(Clone, Default)]
pub struct FakeConnector {
    script: Arc<Mutex<AgentScript>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent for a node id, independent of any stored record.
    pub fn agent(&self, node_id: &str) -> Arc<dyn NodeAgent> {
        Arc::new(FakeAgent {
            node_id: node_id.to_string(),
            script: Arc::clone(&self.script),
        })
    }

    pub fn fail_peer_info(&self, node_id: &str) {
        lock(&self.script).fail_peer_info.insert(node_id.to_string());
    }

    /// Peer info succeeds but advertises no address.
    pub fn zero_addrs(&self, node_id: &str) {
        lock(&self.script).zero_addrs.insert(node_id.to_string());
    }

    pub fn fail_health(&self, node_id: &str) {
        lock(&self.script).fail_health.insert(node_id.to_string());
    }

    pub fn fail_task(&self, node_id: &str, kind: TaskKind) {
        lock(&self.script).fail_task.insert((node_id.to_string(), kind));
    }

    /// Tasks of `kind` on the node never finish until cancelled.
    pub fn block_task(&self, node_id: &str, kind: TaskKind) {
        lock(&self.script).block_task.insert((node_id.to_string(), kind));
    }

    /// Counters reported for every task the node completes.
    pub fn set_stats(&self, node_id: &str, stats: TransferStats) {
        lock(&self.script).stats.insert(node_id.to_string(), stats);
    }

    /// Tasks the node completed, in arrival order.
    pub fn tasks(&self, node_id: &str) -> Vec<Task> {
        lock(&self.script)
            .tasks
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn health_checks(&self, node_id: &str) -> usize {
        lock(&self.script)
            .health_checks
            .get(node_id)
            .copied()
            .unwrap_or_default()
    }
}

impl AgentConnector for FakeConnector {
    fn connect(&self, node: &Node) -> Arc<dyn NodeAgent> {
        self.agent(&node.id)
    }
}

struct FakeAgent {
    node_id: String,
    script: Arc<Mutex<AgentScript>>,
}

impl FakeAgent {
    fn unavailable(&self, what: &str) -> LabError {
        LabError::Unavailable(format!("node {}: {what} failed", self.node_id))
    }
}

impl NodeAgent for FakeAgent {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn health<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, LabResult<()>> {
        Box::pin(async move {
            ensure_active(cancel)?;
            let mut script = lock(&self.script);
            *script.health_checks.entry(self.node_id.clone()).or_default() += 1;
            if script.fail_health.contains(&self.node_id) {
                return Err(self.unavailable("health"));
            }
            Ok(())
        })
    }

    fn peer_info<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, LabResult<PeerInfo>> {
        Box::pin(async move {
            ensure_active(cancel)?;
            let script = lock(&self.script);
            if script.fail_peer_info.contains(&self.node_id) {
                return Err(self.unavailable("peer info"));
            }
            let addrs = if script.zero_addrs.contains(&self.node_id) {
                Vec::new()
            } else {
                vec!["/ip4/127.0.0.1/tcp/4001".to_string()]
            };
            Ok(PeerInfo {
                id: format!("peer-{}", self.node_id),
                addrs,
            })
        })
    }

    fn run_task<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        task: &'a Task,
    ) -> BoxFuture<'a, LabResult<TaskOutcome>> {
        Box::pin(async move {
            ensure_active(cancel)?;
            let key = (self.node_id.clone(), task.kind);
            let blocked = lock(&self.script).block_task.contains(&key);
            if blocked {
                cancel.cancelled().await;
                return Err(LabError::Cancelled);
            }

            let mut script = lock(&self.script);
            if script.fail_task.contains(&key) {
                return Err(self.unavailable(&format!("{} task", task.kind)));
            }
            script
                .tasks
                .entry(self.node_id.clone())
                .or_default()
                .push(task.clone());
            let stats = script.stats.get(&self.node_id).copied().unwrap_or_default();
            Ok(TaskOutcome { stats })
        })
    }
}
