//! One command enum per resource.
//!
//! Handlers only translate HTTP input into a command; executing it is
//! independent of the transport.

use std::sync::Arc;

use peerlab_core::{LabError, LabResult, ResultExt};
use peerlab_experiment::TrialOptions;
use peerlab_query::Query;
use peerlab_state::{
    Benchmark, Cluster, ClusterDefinition, Experiment, ExperimentDefinition, Node, ReadOps,
    Report, Scenario, ScenarioDefinition,
};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::ApiState;

/// Data carried by a successful response.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Cluster(Cluster),
    Clusters(Vec<Cluster>),
    Node(Node),
    Nodes(Vec<Node>),
    Scenario(Scenario),
    Scenarios(Vec<Scenario>),
    Benchmark(Benchmark),
    Benchmarks(Vec<Benchmark>),
    Report(Report),
    Experiment(Experiment),
    Experiments(Vec<Experiment>),
    Deleted(Vec<String>),
}

#[derive(Debug)]
pub struct Relabel {
    pub ids: Vec<String>,
    pub adds: Vec<String>,
    pub removes: Vec<String>,
}

// ── Clusters ───────────────────────────────────────────────────

#[derive(Debug)]
pub enum ClusterCommand {
    List { query: Query },
    Get { name: String },
    Create { name: String, definition: ClusterDefinition },
    Label(Relabel),
    Delete { names: Vec<String> },
}

impl ClusterCommand {
    pub async fn execute(self, state: &ApiState) -> LabResult<Reply> {
        let clusters = &state.clusters;
        Ok(match self {
            ClusterCommand::List { query } => Reply::Clusters(clusters.list(&query)?),
            ClusterCommand::Get { name } => Reply::Cluster(clusters.get(&name)?),
            ClusterCommand::Create { name, definition } => {
                let cancel = state.shutdown.child_token();
                Reply::Cluster(clusters.create(&cancel, &name, definition).await?)
            }
            ClusterCommand::Label(r) => Reply::Clusters(clusters.label(&r.ids, &r.adds, &r.removes)?),
            ClusterCommand::Delete { names } => {
                let cancel = state.shutdown.child_token();
                clusters.destroy_all(&cancel, &names).await?;
                Reply::Deleted(names)
            }
        })
    }
}

// ── Nodes ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum NodeCommand {
    Query { cluster: String, query: Query },
    Get { cluster: String, node: String },
    Label {
        cluster: String,
        query: Query,
        adds: Vec<String>,
        removes: Vec<String>,
    },
}

impl NodeCommand {
    pub fn execute(self, state: &ApiState) -> LabResult<Reply> {
        let clusters = &state.clusters;
        Ok(match self {
            NodeCommand::Query { cluster, query } => {
                Reply::Nodes(clusters.query_nodes(&cluster, &query)?)
            }
            NodeCommand::Get { cluster, node } => Reply::Node(clusters.get_node(&cluster, &node)?),
            NodeCommand::Label {
                cluster,
                query,
                adds,
                removes,
            } => Reply::Nodes(clusters.label_nodes(&cluster, &query, &adds, &removes)?),
        })
    }
}

// ── Scenarios ──────────────────────────────────────────────────

#[derive(Debug)]
pub enum ScenarioCommand {
    List { query: Query },
    Get { name: String },
    Create { name: String, definition: ScenarioDefinition },
    Label(Relabel),
    Delete { names: Vec<String> },
}

impl ScenarioCommand {
    pub fn execute(self, state: &ApiState) -> LabResult<Reply> {
        let store = &state.store;
        Ok(match self {
            ScenarioCommand::List { query } => {
                let scenarios = store.list_scenarios()?;
                Reply::Scenarios(query.filter(&scenarios).into_iter().cloned().collect())
            }
            ScenarioCommand::Get { name } => Reply::Scenario(store.get_scenario(&name)?),
            ScenarioCommand::Create { name, definition } => Reply::Scenario(
                store
                    .update(|tx| tx.create_scenario(Scenario::new(&name, definition)))
                    .with_context(|| format!("create scenario {name}"))?,
            ),
            ScenarioCommand::Label(r) => Reply::Scenarios(
                store
                    .update(|tx| tx.label_scenarios(&r.ids, &r.adds, &r.removes))
                    .context("label scenarios")?,
            ),
            ScenarioCommand::Delete { names } => {
                store
                    .update(|tx| -> LabResult<()> {
                        for name in &names {
                            tx.delete_scenario(name)?;
                        }
                        Ok(())
                    })
                    .context("delete scenarios")?;
                Reply::Deleted(names)
            }
        })
    }
}

// ── Benchmarks ─────────────────────────────────────────────────

#[derive(Debug)]
pub enum BenchmarkCommand {
    List { query: Query },
    Get { id: String },
    Report { id: String },
    Create {
        id: Option<String>,
        cluster: String,
        scenario: String,
    },
    Cancel { id: String },
    Label(Relabel),
    Delete { ids: Vec<String> },
}

fn benchmark_run(id: &str) -> String {
    format!("benchmark/{id}")
}

fn experiment_run(id: &str) -> String {
    format!("experiment/{id}")
}

fn ensure_accepting(state: &ApiState) -> LabResult<()> {
    if state.supervisor.is_closed() {
        return Err(LabError::Unavailable("daemon is shutting down".to_string()));
    }
    Ok(())
}

impl BenchmarkCommand {
    pub fn execute(self, state: &ApiState) -> LabResult<Reply> {
        let benchmarks = &state.benchmarks;
        Ok(match self {
            BenchmarkCommand::List { query } => Reply::Benchmarks(benchmarks.list(&query)?),
            BenchmarkCommand::Get { id } => Reply::Benchmark(benchmarks.get(&id)?),
            BenchmarkCommand::Report { id } => Reply::Report(benchmarks.report(&id)?),
            BenchmarkCommand::Create {
                id,
                cluster,
                scenario,
            } => {
                ensure_accepting(state)?;
                let id = id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                let cancel = state.shutdown.child_token();
                let prepared = benchmarks.prepare(&cancel, &id, &cluster, &scenario)?;
                let running = prepared.benchmark.clone();

                let pipeline = Arc::clone(benchmarks);
                state.supervisor.spawn(benchmark_run(&id), move |cancel| async move {
                    if let Err(e) = pipeline.execute(&cancel, prepared).await {
                        error!(benchmark_id = %id, error = %e, "benchmark outcome not recorded");
                    }
                })?;
                Reply::Benchmark(running)
            }
            BenchmarkCommand::Cancel { id } => {
                state.supervisor.cancel(&benchmark_run(&id))?;
                Reply::Benchmark(benchmarks.get(&id)?)
            }
            BenchmarkCommand::Label(r) => {
                Reply::Benchmarks(benchmarks.label(&r.ids, &r.adds, &r.removes)?)
            }
            BenchmarkCommand::Delete { ids } => {
                benchmarks.delete(&ids)?;
                Reply::Deleted(ids)
            }
        })
    }
}

// ── Experiments ────────────────────────────────────────────────

#[derive(Debug)]
pub enum ExperimentCommand {
    List { query: Query },
    Get { id: String },
    Create {
        definition: ExperimentDefinition,
        options: TrialOptions,
    },
    Cancel { id: String },
    Label(Relabel),
    Delete { ids: Vec<String> },
}

impl ExperimentCommand {
    pub fn execute(self, state: &ApiState) -> LabResult<Reply> {
        let experiments = &state.experiments;
        Ok(match self {
            ExperimentCommand::List { query } => Reply::Experiments(experiments.list(&query)?),
            ExperimentCommand::Get { id } => Reply::Experiment(experiments.get(&id)?),
            ExperimentCommand::Create {
                definition,
                options,
            } => {
                ensure_accepting(state)?;
                let experiment = experiments.create(definition)?;
                let running = experiment.clone();

                let coordinator = Arc::clone(experiments);
                let id = experiment.id.clone();
                state
                    .supervisor
                    .spawn(experiment_run(&id), move |cancel| async move {
                        if let Err(e) = coordinator.execute(&cancel, experiment, options).await {
                            error!(experiment_id = %id, error = %e, "experiment outcome not recorded");
                        }
                    })?;
                Reply::Experiment(running)
            }
            ExperimentCommand::Cancel { id } => {
                state.supervisor.cancel(&experiment_run(&id))?;
                Reply::Experiment(experiments.get(&id)?)
            }
            ExperimentCommand::Label(r) => {
                Reply::Experiments(experiments.label(&r.ids, &r.adds, &r.removes)?)
            }
            ExperimentCommand::Delete { ids } => {
                experiments.delete(&ids)?;
                Reply::Deleted(ids)
            }
        })
    }
}
