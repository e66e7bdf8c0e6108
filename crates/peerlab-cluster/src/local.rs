//! Local node provider.
//!
//! Runs every node as an in-process loopback agent on `host`. Each node
//! reserves two ports from the shared [`PortPool`]: one for its agent API
//! and one it advertises as its p2p transport. The agent acknowledges
//! tasks and tracks the peers it was told to dial, without moving content.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use peerlab_core::{BoxFuture, LabError, LabResult, ensure_active, split_list};
use peerlab_state::{ClusterDefinition, NodeDescriptor, Task, TaskKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{PeerInfo, TaskOutcome};
use crate::ports::PortPool;
use crate::provider::{NodeGroup, NodeProvider, group_node_labels};

/// How long a stopping agent may take to drain its connections.
const STOP_GRACE: Duration = Duration::from_secs(5);

struct LoopbackAgent {
    node_id: String,
    ports: Vec<u16>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LocalProvider {
    host: String,
    ports: Arc<PortPool>,
    /// Running agents keyed by cluster id.
    agents: Mutex<HashMap<String, Vec<LoopbackAgent>>>,
}

impl LocalProvider {
    pub fn new(host: impl Into<String>, ports: Arc<PortPool>) -> Self {
        Self {
            host: host.into(),
            ports,
            agents: Mutex::new(HashMap::new()),
        }
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<String, Vec<LoopbackAgent>>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of agents currently running for `cluster_id`.
    pub fn running_agents(&self, cluster_id: &str) -> usize {
        self.agents().get(cluster_id).map_or(0, Vec::len)
    }

    async fn start_agent(
        &self,
        node_id: String,
        labels: Vec<String>,
    ) -> LabResult<(NodeDescriptor, LoopbackAgent)> {
        let ports = self.ports.acquire(2)?;
        let (agent_port, p2p_port) = (ports[0], ports[1]);

        let listener = match tokio::net::TcpListener::bind((self.host.as_str(), agent_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.ports.release(&ports);
                return Err(LabError::Unavailable(format!(
                    "bind agent for node {node_id} on {}:{agent_port}: {e}",
                    self.host
                )));
            }
        };

        let state = AgentState {
            peer: PeerInfo {
                id: format!("peer-{node_id}"),
                addrs: vec![format!("/ip4/{}/tcp/{p2p_port}", self.host)],
            },
            dialed: Arc::new(Mutex::new(BTreeSet::new())),
        };
        let router = loopback_router(state);
        let stop = CancellationToken::new();
        let shutdown = stop.clone();
        let serve_node = node_id.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!(node_id = %serve_node, error = %e, "loopback agent stopped with error");
            }
        });
        debug!(%node_id, agent_port, p2p_port, "loopback agent started");

        let descriptor = NodeDescriptor {
            id: node_id.clone(),
            address: self.host.clone(),
            agent_port,
            labels,
        };
        Ok((
            descriptor,
            LoopbackAgent {
                node_id,
                ports,
                stop,
                task,
            },
        ))
    }

    async fn stop_agents(&self, agents: Vec<LoopbackAgent>) {
        for mut agent in agents {
            agent.stop.cancel();
            if tokio::time::timeout(STOP_GRACE, &mut agent.task).await.is_err() {
                warn!(node_id = %agent.node_id, "loopback agent did not drain, aborting");
                agent.task.abort();
            }
            self.ports.release(&agent.ports);
        }
    }
}

impl NodeProvider for LocalProvider {
    fn create_node_group<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        cluster_id: &'a str,
        definition: &'a ClusterDefinition,
    ) -> BoxFuture<'a, LabResult<NodeGroup>> {
        Box::pin(async move {
            let groups = match definition {
                ClusterDefinition::Groups { groups } => groups,
                ClusterDefinition::Reference { name } => {
                    return Err(LabError::InvalidArgument(format!(
                        "local provider cannot resolve definition reference {name:?}"
                    )));
                }
            };

            let mut started = Vec::new();
            let mut nodes = Vec::new();
            for group in groups {
                let labels = group_node_labels(group);
                for _ in 0..group.size {
                    let node_id = format!("{cluster_id}-{}", nodes.len());
                    let res = match ensure_active(cancel) {
                        Ok(()) => self.start_agent(node_id, labels.clone()).await,
                        Err(e) => Err(e),
                    };
                    match res {
                        Ok((descriptor, agent)) => {
                            nodes.push(descriptor);
                            started.push(agent);
                        }
                        Err(e) => {
                            self.stop_agents(started).await;
                            return Err(e);
                        }
                    }
                }
            }

            info!(%cluster_id, nodes = nodes.len(), "local node group started");
            self.agents()
                .entry(cluster_id.to_string())
                .or_default()
                .extend(started);
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
            let doomed: Vec<LoopbackAgent> = {
                let mut agents = self.agents();
                let Some(running) = agents.get_mut(&group.cluster_id) else {
                    warn!(cluster_id = %group.cluster_id, "no local agents to destroy");
                    return Ok(());
                };
                let (doomed, kept): (Vec<_>, Vec<_>) = running
                    .drain(..)
                    .partition(|a| group.nodes.iter().any(|n| n.id == a.node_id));
                if kept.is_empty() {
                    agents.remove(&group.cluster_id);
                } else {
                    *running = kept;
                }
                doomed
            };

            let stopped = doomed.len();
            self.stop_agents(doomed).await;
            info!(cluster_id = %group.cluster_id, stopped, "local node group destroyed");
            Ok(())
        })
    }
}

// ── Loopback agent ────────────────────────────────────────────────

#[derive(Clone)]
struct AgentState {
    peer: PeerInfo,
    dialed: Arc<Mutex<BTreeSet<String>>>,
}

fn loopback_router(state: AgentState) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/peerinfo", get(peer_info))
        .route("/run", post(run_task))
        .with_state(state)
}

async fn healthcheck() -> StatusCode {
    StatusCode::OK
}

async fn peer_info(State(state): State<AgentState>) -> Json<PeerInfo> {
    Json(state.peer.clone())
}

async fn run_task(State(state): State<AgentState>, Json(task): Json<Task>) -> Json<TaskOutcome> {
    let own = state.peer.peer_address();
    let mut dialed = state.dialed.lock().unwrap_or_else(|e| e.into_inner());
    match task.kind {
        TaskKind::Connect => {
            for addr in split_list(&task.subject) {
                if Some(&addr) != own.as_ref() {
                    dialed.insert(addr);
                }
            }
        }
        TaskKind::Disconnect => {
            for addr in split_list(&task.subject) {
                dialed.remove(&addr);
            }
        }
        TaskKind::Get | TaskKind::Update => {}
    }
    debug!(peer = %state.peer.id, kind = %task.kind, peers = dialed.len(), "task acknowledged");
    Json(TaskOutcome::default())
}
