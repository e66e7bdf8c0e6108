//! Benchmark pipeline.
//!
//! A benchmark is prepared synchronously (plan plus a `running` record)
//! and executed separately, so callers can hand the running record back
//! before any node has been contacted. Execution always ends in exactly one
//! transaction that writes the report and the terminal status together.

use std::sync::Arc;

use peerlab_cluster::ClusterManager;
use peerlab_core::{LabError, LabResult, ResultExt, ensure_active};
use peerlab_query::Query;
use peerlab_scenario::{Planner, QuerySelections, aborted, aggregate, run};
use peerlab_state::{
    Benchmark, BenchmarkStatus, ClusterStatus, Node, ReadOps, Report, StateStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A persisted `running` benchmark and what its run needs.
#[derive(Debug, Clone)]
pub struct PreparedBenchmark {
    pub benchmark: Benchmark,
    pub nodes: Vec<Node>,
    pub queries: QuerySelections,
}

pub struct BenchmarkPipeline {
    store: StateStore,
    clusters: Arc<ClusterManager>,
    planner: Planner,
    seeders: Vec<String>,
    trace_ui: Option<String>,
}

impl BenchmarkPipeline {
    pub fn new(store: StateStore, clusters: Arc<ClusterManager>, planner: Planner) -> Self {
        Self {
            store,
            clusters,
            planner,
            seeders: Vec::new(),
            trace_ui: None,
        }
    }

    /// Peer addresses seed nodes dial before fetching content.
    pub fn with_seeders(mut self, seeders: Vec<String>) -> Self {
        self.seeders = seeders;
        self
    }

    /// Base URL of the trace UI; reports then link to their trace.
    pub fn with_trace_ui(mut self, trace_ui: Option<String>) -> Self {
        self.trace_ui = trace_ui;
        self
    }

    /// Plan a scenario against every node of a created cluster and record
    /// the benchmark as running.
    pub fn prepare(
        &self,
        cancel: &CancellationToken,
        id: &str,
        cluster_id: &str,
        scenario_id: &str,
    ) -> LabResult<PreparedBenchmark> {
        let op = || format!("prepare benchmark {id}");
        let (cluster, scenario, nodes) = self
            .store
            .view(|tx| -> LabResult<_> {
                Ok((
                    tx.get_cluster(cluster_id)?,
                    tx.get_scenario(scenario_id)?,
                    tx.list_nodes(cluster_id)?,
                ))
            })
            .with_context(op)?;
        if cluster.status != ClusterStatus::Created {
            return Err(LabError::FailedPrecondition(format!(
                "cluster {cluster_id} is {}, not created",
                cluster.status
            )))
            .with_context(op);
        }

        let (plan, queries) = self
            .planner
            .plan(&scenario.definition, &nodes)
            .with_context(op)?;

        ensure_active(cancel).with_context(op)?;
        let benchmark = self
            .store
            .update(|tx| tx.create_benchmark(Benchmark::new(id, cluster, scenario, plan)))
            .with_context(op)?;
        info!(benchmark_id = %id, %cluster_id, %scenario_id, nodes = nodes.len(), "benchmark running");

        Ok(PreparedBenchmark {
            benchmark,
            nodes,
            queries,
        })
    }

    /// Run a prepared benchmark and record its outcome.
    ///
    /// Node failures and cancellation end the benchmark as `error` with the
    /// partial report kept; only a failure to record the outcome is returned
    /// as an error.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        prepared: PreparedBenchmark,
    ) -> LabResult<Benchmark> {
        let PreparedBenchmark {
            mut benchmark,
            nodes,
            queries,
        } = prepared;

        let agents = self.clusters.agents(&nodes);
        let report = match run(cancel, &agents, &benchmark.plan, &self.seeders).await {
            Ok(execution) => aggregate(
                &benchmark.id,
                &execution,
                &queries,
                self.trace_ui.as_deref(),
            ),
            Err(e) => {
                warn!(benchmark_id = %benchmark.id, error = %e, "benchmark run aborted");
                aborted(&benchmark.id, &queries, &e)
            }
        };

        benchmark.status = match report.summary.error {
            None => BenchmarkStatus::Done,
            Some(_) => BenchmarkStatus::Error,
        };
        benchmark.error = report.summary.error.clone();

        // Recorded even after cancellation so the benchmark never stays running.
        let benchmark = self
            .store
            .update(|tx| -> LabResult<_> {
                tx.create_report(&benchmark.id, report)?;
                Ok(tx.update_benchmark(benchmark)?)
            })
            .context("record benchmark outcome")?;
        info!(benchmark_id = %benchmark.id, status = %benchmark.status, "benchmark finished");
        Ok(benchmark)
    }

    /// Prepare and execute in one call.
    pub async fn run_benchmark(
        &self,
        cancel: &CancellationToken,
        id: &str,
        cluster_id: &str,
        scenario_id: &str,
    ) -> LabResult<Benchmark> {
        let prepared = self.prepare(cancel, id, cluster_id, scenario_id)?;
        self.execute(cancel, prepared).await
    }

    pub fn get(&self, id: &str) -> LabResult<Benchmark> {
        Ok(self.store.get_benchmark(id)?)
    }

    pub fn list(&self, query: &Query) -> LabResult<Vec<Benchmark>> {
        let benchmarks = self.store.list_benchmarks()?;
        Ok(query.filter(&benchmarks).into_iter().cloned().collect())
    }

    pub fn report(&self, id: &str) -> LabResult<Report> {
        Ok(self.store.get_report(id)?)
    }

    pub fn label(
        &self,
        ids: &[String],
        adds: &[String],
        removes: &[String],
    ) -> LabResult<Vec<Benchmark>> {
        self.store
            .update(|tx| tx.label_benchmarks(ids, adds, removes))
            .context("label benchmarks")
    }

    /// Delete finished benchmarks and their reports, all or nothing.
    pub fn delete(&self, ids: &[String]) -> LabResult<()> {
        self.store
            .update(|tx| -> LabResult<_> {
                for id in ids {
                    let benchmark = tx.get_benchmark(id)?;
                    if !benchmark.status.is_terminal() {
                        return Err(LabError::FailedPrecondition(format!(
                            "benchmark {id} is still running"
                        )));
                    }
                    tx.delete_benchmark(id)?;
                }
                Ok(())
            })
            .context("delete benchmarks")
    }
}
