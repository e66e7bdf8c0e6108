//! Cluster lifecycle manager.
//!
//! ```text
//!   create:  creating ──► connecting ──► created
//!   destroy: (any) ──► destroying ──► removed
//! ```
//!
//! Every transition is committed before the next step starts, so a failed
//! create leaves the cluster in its last committed state and a crashed
//! destroy stays visible as `destroying` until someone re-issues it.

use std::sync::Arc;
use std::time::Duration;

use peerlab_core::config::ClusterConfig;
use peerlab_core::{
    LabError, LabResult, ResultExt, cancellable, ensure_active, try_join_all,
};
use peerlab_query::Query;
use peerlab_state::{
    Cluster, ClusterDefinition, ClusterStatus, Node, NodeHealth, ReadOps, StateStore, Task,
    TaskKind, WriteTx,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentConnector, NodeAgent};
use crate::bootstrap::{bootstrap, broadcast};
use crate::provider::{NodeGroup, NodeProvider};

/// How long to wait for fresh nodes to answer health checks.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(500),
        }
    }
}

impl From<&ClusterConfig> for HealthPolicy {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            attempts: config.health_attempts,
            interval: config.health_interval(),
        }
    }
}

/// Drives clusters through their state machine.
pub struct ClusterManager {
    store: StateStore,
    provider: Arc<dyn NodeProvider>,
    connector: Arc<dyn AgentConnector>,
    health: HealthPolicy,
}

impl ClusterManager {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn NodeProvider>,
        connector: Arc<dyn AgentConnector>,
    ) -> Self {
        Self {
            store,
            provider,
            connector,
            health: HealthPolicy::default(),
        }
    }

    pub fn with_health_policy(mut self, health: HealthPolicy) -> Self {
        self.health = health;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Agent handles for `nodes`, in the same order.
    pub fn agents(&self, nodes: &[Node]) -> Vec<Arc<dyn NodeAgent>> {
        nodes.iter().map(|n| self.connector.connect(n)).collect()
    }

    /// Run `f` in one store transaction unless `cancel` already fired.
    fn commit<T, F>(&self, cancel: &CancellationToken, f: F) -> LabResult<T>
    where
        F: FnOnce(&WriteTx) -> LabResult<T>,
    {
        ensure_active(cancel)?;
        self.store.update(f)
    }

    // ── Create ─────────────────────────────────────────────────────

    /// Provision, record, health-check and bootstrap a new cluster.
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        id: &str,
        definition: ClusterDefinition,
    ) -> LabResult<Cluster> {
        let op = || format!("create cluster {id}");
        validate_definition(&definition).with_context(op)?;

        let mut cluster = self
            .commit(cancel, |tx| Ok(tx.create_cluster(Cluster::new(id, definition))?))
            .with_context(op)?;
        info!(cluster_id = %id, status = %cluster.status, "cluster record created");

        let group = self
            .provider
            .create_node_group(cancel, id, &cluster.definition)
            .await
            .with_context(op)?;
        debug!(cluster_id = %id, nodes = group.nodes.len(), "node group provisioned");

        cluster.status = ClusterStatus::Connecting;
        let persisted = self.commit(cancel, |tx| {
            let cluster = tx.update_cluster(cluster)?;
            let nodes = tx.create_nodes(id, &group.nodes)?;
            Ok((cluster, nodes))
        });
        let (mut cluster, nodes) = match persisted {
            Ok(persisted) => persisted,
            Err(err) => {
                // The group never reached the store, so nothing else could
                // tear it down later.
                self.release_group(&group).await;
                return Err(err.context(op()));
            }
        };
        info!(cluster_id = %id, status = %cluster.status, nodes = nodes.len(), "nodes recorded");

        let agents = self.agents(&nodes);
        self.wait_healthy(cancel, &nodes, &agents)
            .await
            .with_context(op)?;
        bootstrap(cancel, &agents).await.with_context(op)?;

        cluster.status = ClusterStatus::Created;
        let cluster = self
            .commit(cancel, |tx| Ok(tx.update_cluster(cluster)?))
            .with_context(op)?;
        info!(cluster_id = %id, status = %cluster.status, "cluster ready");
        Ok(cluster)
    }

    async fn release_group(&self, group: &NodeGroup) {
        let fresh = CancellationToken::new();
        if let Err(e) = self.provider.destroy_node_group(&fresh, group).await {
            warn!(cluster_id = %group.cluster_id, error = %e, "failed to release unrecorded node group");
        }
    }

    /// Poll every node until healthy, then record them as healthy.
    async fn wait_healthy(
        &self,
        cancel: &CancellationToken,
        nodes: &[Node],
        agents: &[Arc<dyn NodeAgent>],
    ) -> LabResult<()> {
        let policy = self.health;
        let probes = agents.iter().map(|agent| {
            let agent = Arc::clone(agent);
            let cancel = cancel.clone();
            async move { poll_health(&cancel, agent.as_ref(), policy).await }
        });
        try_join_all(cancel, probes).await?;

        self.commit(cancel, |tx| {
            for node in nodes {
                let mut node = node.clone();
                node.health = NodeHealth::Healthy;
                tx.update_node(node)?;
            }
            Ok(())
        })?;
        debug!(nodes = nodes.len(), "nodes healthy");
        Ok(())
    }

    /// Refresh every node of a cluster, then connect them again.
    pub async fn reset(&self, cancel: &CancellationToken, id: &str) -> LabResult<()> {
        let op = || format!("reset cluster {id}");
        let nodes = self.store.list_nodes(id).with_context(op)?;
        let agents = self.agents(&nodes);
        broadcast(cancel, &agents, Task::new(TaskKind::Update, ""))
            .await
            .with_context(op)?;
        bootstrap(cancel, &agents).await.with_context(op)?;
        info!(cluster_id = %id, nodes = nodes.len(), "cluster reset");
        Ok(())
    }

    // ── Destroy ────────────────────────────────────────────────────

    /// Mark a cluster destroying, tear down its nodes, then delete it.
    pub async fn destroy(&self, cancel: &CancellationToken, id: &str) -> LabResult<()> {
        let op = || format!("destroy cluster {id}");
        let mut cluster = self.store.get_cluster(id).with_context(op)?;

        if cluster.status != ClusterStatus::Destroying {
            cluster.status = ClusterStatus::Destroying;
            self.commit(cancel, |tx| Ok(tx.update_cluster(cluster)?))
                .with_context(op)?;
            info!(cluster_id = %id, "cluster destroying");
        }

        let nodes = self.store.list_nodes(id).with_context(op)?;
        let group = NodeGroup::from_nodes(id, &nodes);
        self.provider
            .destroy_node_group(cancel, &group)
            .await
            .with_context(op)?;

        self.commit(cancel, |tx| Ok(tx.delete_cluster(id)?))
            .with_context(op)?;
        info!(cluster_id = %id, nodes = nodes.len(), "cluster destroyed");
        Ok(())
    }

    /// Destroy clusters one after another, stopping at the first failure.
    pub async fn destroy_all(&self, cancel: &CancellationToken, ids: &[String]) -> LabResult<()> {
        for id in ids {
            self.destroy(cancel, id).await?;
        }
        Ok(())
    }

    // ── Metadata ───────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> LabResult<Cluster> {
        Ok(self.store.get_cluster(id)?)
    }

    pub fn list(&self, query: &Query) -> LabResult<Vec<Cluster>> {
        let clusters = self.store.list_clusters()?;
        Ok(query.filter(&clusters).into_iter().cloned().collect())
    }

    /// Add and remove labels on a set of clusters, all or nothing.
    pub fn label(
        &self,
        ids: &[String],
        adds: &[String],
        removes: &[String],
    ) -> LabResult<Vec<Cluster>> {
        self.store
            .update(|tx| tx.label_clusters(ids, adds, removes))
            .context("label clusters")
    }

    pub fn nodes(&self, cluster_id: &str) -> LabResult<Vec<Node>> {
        self.store.get_cluster(cluster_id)?;
        Ok(self.store.list_nodes(cluster_id)?)
    }

    pub fn get_node(&self, cluster_id: &str, node_id: &str) -> LabResult<Node> {
        Ok(self.store.get_node(cluster_id, node_id)?)
    }

    /// Nodes of a cluster matching `query`.
    pub fn query_nodes(&self, cluster_id: &str, query: &Query) -> LabResult<Vec<Node>> {
        let nodes = self.nodes(cluster_id)?;
        Ok(query.filter(&nodes).into_iter().cloned().collect())
    }

    /// Relabel the nodes of a cluster matching `query`.
    pub fn label_nodes(
        &self,
        cluster_id: &str,
        query: &Query,
        adds: &[String],
        removes: &[String],
    ) -> LabResult<Vec<Node>> {
        self.store
            .update(|tx| -> LabResult<_> {
                tx.get_cluster(cluster_id)?;
                let nodes = tx.list_nodes(cluster_id)?;
                let ids: Vec<String> = query
                    .filter(&nodes)
                    .into_iter()
                    .map(|n| n.id.clone())
                    .collect();
                Ok(tx.label_nodes(cluster_id, &ids, adds, removes)?)
            })
            .with_context(|| format!("label nodes of cluster {cluster_id}"))
    }
}

fn validate_definition(definition: &ClusterDefinition) -> LabResult<()> {
    match definition {
        ClusterDefinition::Groups { groups } => {
            if groups.iter().map(|g| g.size).sum::<usize>() == 0 {
                return Err(LabError::InvalidArgument(
                    "cluster definition has no nodes".to_string(),
                ));
            }
        }
        ClusterDefinition::Reference { name } => {
            if name.trim().is_empty() {
                return Err(LabError::InvalidArgument(
                    "cluster definition reference is empty".to_string(),
                ));
            }
        }
    }
    Ok(())
}

async fn poll_health(
    cancel: &CancellationToken,
    agent: &dyn NodeAgent,
    policy: HealthPolicy,
) -> LabResult<()> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match agent.health(cancel).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!(node_id = %agent.node_id(), attempt, error = %e, "node not healthy yet");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            cancellable(cancel, async {
                tokio::time::sleep(policy.interval).await;
                Ok(())
            })
            .await?;
        }
    }

    let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(LabError::Unavailable(format!(
        "node {} not healthy after {attempts} attempts: {detail}",
        agent.node_id()
    )))
}
