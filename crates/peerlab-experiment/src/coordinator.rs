//! Experiment coordinator.
//!
//! Each trial gets its own cluster `{experiment_id}-{index}`, a scenario
//! and a benchmark with the same id. Trials run concurrently under one
//! shared group token: the first trial that fails cancels it, the others
//! stop at their next step and still tear their clusters down. A trial
//! whose benchmark merely ended in `error` does not cancel its siblings.
//! The experiment record is finalized once every trial has returned.

use std::sync::Arc;

use peerlab_cluster::ClusterManager;
use peerlab_core::{LabError, LabResult, ResultExt, cancellable, ensure_active};
use peerlab_query::Query;
use peerlab_state::{
    BenchmarkStatus, Experiment, ExperimentDefinition, ExperimentStatus, ReadOps, Scenario,
    StateError, StateStore, TrialDefinition, apply_labels,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::benchmark::BenchmarkPipeline;

#[derive(Debug, Clone, Copy)]
pub struct TrialOptions {
    /// Refresh and re-bootstrap every node before planning.
    pub reset: bool,
}

impl Default for TrialOptions {
    fn default() -> Self {
        Self { reset: true }
    }
}

#[derive(Clone)]
pub struct ExperimentCoordinator {
    store: StateStore,
    clusters: Arc<ClusterManager>,
    pipeline: Arc<BenchmarkPipeline>,
    limit: Option<Arc<Semaphore>>,
}

/// How one trial ended.
struct TrialOutcome {
    benchmark_id: String,
    status: BenchmarkStatus,
    error: Option<String>,
}

impl ExperimentCoordinator {
    pub fn new(
        store: StateStore,
        clusters: Arc<ClusterManager>,
        pipeline: Arc<BenchmarkPipeline>,
    ) -> Self {
        Self {
            store,
            clusters,
            pipeline,
            limit: None,
        }
    }

    /// Bound concurrently running trials across all experiments. Zero
    /// leaves them unbounded.
    pub fn with_max_concurrent_trials(mut self, max: usize) -> Self {
        self.limit = (max > 0).then(|| Arc::new(Semaphore::new(max)));
        self
    }

    /// Record a new running experiment under a generated id.
    pub fn create(&self, definition: ExperimentDefinition) -> LabResult<Experiment> {
        if definition.trials.is_empty() {
            return Err(LabError::InvalidArgument(
                "experiment has no trials".to_string(),
            ));
        }
        let id = Uuid::new_v4().simple().to_string();
        let experiment = self
            .store
            .update(|tx| tx.create_experiment(Experiment::new(&id, definition)))
            .with_context(|| format!("create experiment {id}"))?;
        info!(experiment_id = %id, trials = experiment.definition.trials.len(), "experiment running");
        Ok(experiment)
    }

    /// Run every trial of a recorded experiment and finalize it.
    ///
    /// Trial failures end up in the experiment's status and error; only a
    /// failure to record the final state is returned as an error.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        mut experiment: Experiment,
        options: TrialOptions,
    ) -> LabResult<Experiment> {
        let span = info_span!("experiment", experiment_id = %experiment.id);
        let group = cancel.child_token();

        let mut trials = JoinSet::new();
        for (index, trial) in experiment.definition.trials.iter().cloned().enumerate() {
            let this = self.clone();
            let group = group.clone();
            let experiment_id = experiment.id.clone();
            trials.spawn(
                async move {
                    let outcome = this
                        .run_trial(&group, &experiment_id, index, trial, options)
                        .await;
                    (index, outcome)
                }
                .instrument(span.clone()),
            );
        }

        let mut outcomes = Vec::new();
        let mut first_error: Option<String> = None;
        while let Some(joined) = trials.join_next().await {
            let failure = match joined {
                Ok((index, Ok(outcome))) => {
                    outcomes.push((index, outcome));
                    continue;
                }
                Ok((index, Err(e))) => format!("trial {index}: {e}"),
                Err(join_err) => format!("trial task failed: {join_err}"),
            };
            if first_error.is_none() {
                warn!(experiment_id = %experiment.id, error = %failure, "trial failed, cancelling siblings");
                group.cancel();
                first_error = Some(failure);
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);

        let benchmark_error = outcomes.iter().find_map(|(index, o)| {
            (o.status == BenchmarkStatus::Error).then(|| {
                format!(
                    "trial {index}: benchmark {} failed: {}",
                    o.benchmark_id,
                    o.error.as_deref().unwrap_or("unknown error")
                )
            })
        });
        let error = first_error.or(benchmark_error);

        experiment.benchmarks = outcomes.into_iter().map(|(_, o)| o.benchmark_id).collect();
        experiment.status = match error {
            None => ExperimentStatus::Done,
            Some(_) => ExperimentStatus::Error,
        };
        experiment.error = error;

        let experiment = self
            .store
            .update(|tx| tx.update_experiment(experiment))
            .context("record experiment outcome")?;
        info!(
            experiment_id = %experiment.id,
            status = %experiment.status,
            benchmarks = experiment.benchmarks.len(),
            "experiment finished"
        );
        Ok(experiment)
    }

    /// Create and execute in one call.
    pub async fn run_experiment(
        &self,
        cancel: &CancellationToken,
        definition: ExperimentDefinition,
        options: TrialOptions,
    ) -> LabResult<Experiment> {
        let experiment = self.create(definition)?;
        self.execute(cancel, experiment, options).await
    }

    async fn run_trial(
        &self,
        cancel: &CancellationToken,
        experiment_id: &str,
        index: usize,
        trial: TrialDefinition,
        options: TrialOptions,
    ) -> LabResult<TrialOutcome> {
        let _permit = match &self.limit {
            Some(limit) => Some(
                cancellable(cancel, async {
                    Arc::clone(limit)
                        .acquire_owned()
                        .await
                        .map_err(|_| LabError::Internal("trial limiter closed".to_string()))
                })
                .await?,
            ),
            None => None,
        };

        let trial_id = format!("{experiment_id}-{index}");
        let outcome = self
            .trial_body(cancel, experiment_id, &trial_id, index, trial, options)
            .await;

        let teardown = self.teardown(&trial_id).await;
        match (outcome, teardown) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                error!(cluster_id = %trial_id, error = %teardown, "trial teardown failed");
                Err(e)
            }
        }
    }

    async fn trial_body(
        &self,
        cancel: &CancellationToken,
        experiment_id: &str,
        trial_id: &str,
        index: usize,
        trial: TrialDefinition,
        options: TrialOptions,
    ) -> LabResult<TrialOutcome> {
        self.clusters.create(cancel, trial_id, trial.cluster).await?;

        let mut scenario = Scenario::new(trial_id, trial.scenario);
        apply_labels(
            &mut scenario.labels,
            &[experiment_id.to_string(), format!("trial-{index}")],
            &[],
        );
        ensure_active(cancel)?;
        self.store
            .update(|tx| tx.create_scenario(scenario))
            .with_context(|| format!("create scenario {trial_id}"))?;

        if options.reset {
            self.clusters.reset(cancel, trial_id).await?;
        }

        let benchmark = self
            .pipeline
            .run_benchmark(cancel, trial_id, trial_id, trial_id)
            .await?;
        Ok(TrialOutcome {
            benchmark_id: benchmark.id,
            status: benchmark.status,
            error: benchmark.error,
        })
    }

    /// Destroy a trial's cluster if it got as far as being recorded.
    async fn teardown(&self, cluster_id: &str) -> LabResult<()> {
        match self.store.get_cluster(cluster_id) {
            Ok(_) => {}
            Err(StateError::NotFound(_)) => return Ok(()),
            Err(e) => {
                return Err(LabError::from(e).context(format!("look up trial cluster {cluster_id}")));
            }
        }
        let fresh = CancellationToken::new();
        self.clusters.destroy(&fresh, cluster_id).await
    }

    pub fn get(&self, id: &str) -> LabResult<Experiment> {
        Ok(self.store.get_experiment(id)?)
    }

    pub fn list(&self, query: &Query) -> LabResult<Vec<Experiment>> {
        let experiments = self.store.list_experiments()?;
        Ok(query.filter(&experiments).into_iter().cloned().collect())
    }

    pub fn label(
        &self,
        ids: &[String],
        adds: &[String],
        removes: &[String],
    ) -> LabResult<Vec<Experiment>> {
        self.store
            .update(|tx| tx.label_experiments(ids, adds, removes))
            .context("label experiments")
    }

    /// Delete finished experiments, all or nothing.
    pub fn delete(&self, ids: &[String]) -> LabResult<()> {
        self.store
            .update(|tx| -> LabResult<_> {
                for id in ids {
                    let experiment = tx.get_experiment(id)?;
                    if !experiment.status.is_terminal() {
                        return Err(LabError::FailedPrecondition(format!(
                            "experiment {id} is still running"
                        )));
                    }
                    tx.delete_experiment(id)?;
                }
                Ok(())
            })
            .context("delete experiments")
    }
}
