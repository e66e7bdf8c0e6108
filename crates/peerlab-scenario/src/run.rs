//! Plan execution against node agents.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use peerlab_cluster::NodeAgent;
use peerlab_core::{LabError, LabResult, ResultExt, epoch_millis, try_join_all};
use peerlab_state::{NodeTrace, Plan, Task, TaskKind};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Raw outcome of one run, before aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub trace_id: String,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Benchmark-phase traces keyed by node id.
    pub nodes: BTreeMap<String, NodeTrace>,
    /// A benchmark node was cut short by cancellation.
    pub cancelled: bool,
}

impl Execution {
    pub fn failed_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, t)| t.failed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.nodes.values().all(|t| !t.failed())
    }
}

type Assignment = (Arc<dyn NodeAgent>, Vec<Task>);

fn assignments(
    phase: &str,
    agents: &HashMap<&str, &Arc<dyn NodeAgent>>,
    tasks: &BTreeMap<String, Vec<Task>>,
) -> LabResult<Vec<Assignment>> {
    tasks
        .iter()
        .map(|(node_id, tasks)| {
            let agent = agents.get(node_id.as_str()).ok_or_else(|| {
                LabError::InvalidArgument(format!(
                    "{phase} plan targets node {node_id} outside the selection"
                ))
            })?;
            Ok((Arc::clone(agent), tasks.clone()))
        })
        .collect()
}

/// Execute `plan` on the selected `agents`.
///
/// Seed nodes first dial `seeders`, then fetch their objects; any seed
/// failure fails the run. Benchmark nodes then run their tasks
/// concurrently, one call in flight per node. A failing benchmark node
/// stops its own task list and is recorded in its trace; the other nodes
/// carry on.
pub async fn run(
    cancel: &CancellationToken,
    agents: &[Arc<dyn NodeAgent>],
    plan: &Plan,
    seeders: &[String],
) -> LabResult<Execution> {
    let trace_id = Uuid::new_v4().simple().to_string();
    let span = info_span!("benchmark_run", %trace_id, nodes = agents.len());

    async move {
        let by_id: HashMap<&str, &Arc<dyn NodeAgent>> =
            agents.iter().map(|a| (a.node_id(), a)).collect();
        let seed = assignments("seed", &by_id, &plan.seed)?;
        let benchmark = assignments("benchmark", &by_id, &plan.benchmark)?;

        let start_ms = epoch_millis();
        seed_phase(cancel, seed, seeders).await.context("seed phase")?;
        let (nodes, cancelled) = benchmark_phase(cancel, benchmark).await;
        let end_ms = epoch_millis();

        let execution = Execution {
            trace_id: trace_id.clone(),
            start_ms,
            end_ms,
            nodes,
            cancelled,
        };
        let failed = execution.failed_nodes();
        if execution.succeeded() {
            info!(elapsed_ms = end_ms.saturating_sub(start_ms), "benchmark run finished");
        } else {
            warn!(
                failed = failed.len(),
                cancelled = execution.cancelled,
                "benchmark run finished with failures"
            );
        }
        Ok(execution)
    }
    .instrument(span)
    .await
}

async fn seed_phase(
    cancel: &CancellationToken,
    seed: Vec<Assignment>,
    seeders: &[String],
) -> LabResult<()> {
    if seed.is_empty() {
        return Ok(());
    }
    let dial = (!seeders.is_empty()).then(|| Task::new(TaskKind::Connect, seeders.join(",")));

    let calls = seed.into_iter().map(|(agent, tasks)| {
        let cancel = cancel.clone();
        let dial = dial.clone();
        async move {
            if let Some(dial) = &dial {
                agent
                    .run_task(&cancel, dial)
                    .await
                    .with_context(|| format!("dial seeders from node {}", agent.node_id()))?;
            }
            for task in &tasks {
                agent
                    .run_task(&cancel, task)
                    .await
                    .with_context(|| format!("seed {} on node {}", task.subject, agent.node_id()))?;
            }
            Ok::<(), LabError>(())
        }
        .in_current_span()
    });
    let seeded = try_join_all(cancel, calls).await?;
    debug!(nodes = seeded.len(), "seed phase complete");
    Ok(())
}

/// Returns the per-node traces and whether any node was cut short by
/// cancellation. A cancel arriving after every node finished is ignored.
async fn benchmark_phase(
    cancel: &CancellationToken,
    benchmark: Vec<Assignment>,
) -> (BTreeMap<String, NodeTrace>, bool) {
    let handles: Vec<_> = benchmark
        .into_iter()
        .map(|(agent, tasks)| {
            let cancel = cancel.clone();
            let node_id = agent.node_id().to_string();
            let handle = tokio::spawn(run_node(cancel, agent, tasks).in_current_span());
            (node_id, handle)
        })
        .collect();

    let mut traces = BTreeMap::new();
    let mut cancelled = false;
    for (node_id, handle) in handles {
        let trace = match handle.await {
            Ok((trace, interrupted)) => {
                cancelled |= interrupted;
                trace
            }
            Err(join_err) => {
                error!(%node_id, error = %join_err, "benchmark task aborted");
                NodeTrace {
                    error: Some(format!("task aborted: {join_err}")),
                    ..NodeTrace::default()
                }
            }
        };
        traces.insert(node_id, trace);
    }
    (traces, cancelled)
}

async fn run_node(
    cancel: CancellationToken,
    agent: Arc<dyn NodeAgent>,
    tasks: Vec<Task>,
) -> (NodeTrace, bool) {
    let mut interrupted = false;
    let mut trace = NodeTrace {
        start_ms: epoch_millis(),
        ..NodeTrace::default()
    };
    for task in &tasks {
        match agent.run_task(&cancel, task).await {
            Ok(outcome) => {
                trace.tasks += 1;
                trace.stats.accumulate(&outcome.stats);
            }
            Err(e) => {
                warn!(node_id = %agent.node_id(), kind = %task.kind, error = %e, "benchmark task failed");
                interrupted = e.is_cancelled();
                trace.error = Some(e.to_string());
                break;
            }
        }
    }
    trace.end_ms = epoch_millis();
    (trace, interrupted)
}
