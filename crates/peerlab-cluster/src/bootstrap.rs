//! Peer bootstrap: turn reachable nodes into a connected swarm.
//!
//! 1. Ask every node for its [`PeerInfo`](crate::PeerInfo) concurrently.
//! 2. Build `{addr}/p2p/{peer_id}` for each.
//! 3. Tell every node, concurrently, to connect to the whole list.
//!
//! Both fan-outs are all-or-nothing: one failed node aborts the bootstrap
//! and cancels the calls still in flight. Running it twice re-dials every
//! pair, which is safe.

use std::sync::Arc;

use peerlab_core::{LabError, LabResult, ResultExt, try_join_all};
use peerlab_state::{Task, TaskKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::NodeAgent;

/// Collect one peer address per agent, in agent order.
pub async fn collect_peer_addrs(
    cancel: &CancellationToken,
    agents: &[Arc<dyn NodeAgent>],
) -> LabResult<Vec<String>> {
    let calls = agents.iter().map(|agent| {
        let agent = Arc::clone(agent);
        let cancel = cancel.clone();
        async move {
            let info = agent
                .peer_info(&cancel)
                .await
                .with_context(|| format!("peer info of node {}", agent.node_id()))?;
            info.peer_address().ok_or_else(|| {
                LabError::Unavailable(format!("node {} reported zero addresses", agent.node_id()))
            })
        }
    });
    try_join_all(cancel, calls).await
}

/// Send the same task to every agent; the first failure aborts the rest.
pub async fn broadcast(
    cancel: &CancellationToken,
    agents: &[Arc<dyn NodeAgent>],
    task: Task,
) -> LabResult<()> {
    let task = Arc::new(task);
    let calls = agents.iter().map(|agent| {
        let agent = Arc::clone(agent);
        let cancel = cancel.clone();
        let task = Arc::clone(&task);
        async move {
            agent
                .run_task(&cancel, &task)
                .await
                .with_context(|| format!("{} on node {}", task.kind, agent.node_id()))
        }
    });
    try_join_all(cancel, calls).await?;
    Ok(())
}

/// Connect every agent to every other one. Returns the peer addresses.
pub async fn bootstrap(
    cancel: &CancellationToken,
    agents: &[Arc<dyn NodeAgent>],
) -> LabResult<Vec<String>> {
    let addrs = collect_peer_addrs(cancel, agents).await?;
    debug!(peers = addrs.len(), "peer addresses collected");

    broadcast(cancel, agents, Task::new(TaskKind::Connect, addrs.join(","))).await?;
    info!(nodes = agents.len(), "swarm connected");
    Ok(addrs)
}
