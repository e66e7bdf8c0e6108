//! Daemon assembly and the serve loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use peerlab_api::ApiState;
use peerlab_cluster::{ClusterManager, HealthPolicy, HttpAgentConnector, LocalProvider, PortPool};
use peerlab_core::LabdConfig;
use peerlab_experiment::{BenchmarkPipeline, ExperimentCoordinator, RunSupervisor};
use peerlab_query::Query;
use peerlab_scenario::Planner;
use peerlab_state::StateStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Upper bound on one agent request.
const AGENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build every subsystem over the store at `config.db_path()`.
pub fn assemble(config: &LabdConfig) -> anyhow::Result<ApiState> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)
        .with_context(|| format!("open metadata store {}", db_path.display()))?;
    info!(path = ?db_path, "metadata store opened");

    let ports = Arc::new(PortPool::new(config.provider.host.clone()));
    let provider = Arc::new(LocalProvider::new(config.provider.host.clone(), ports));
    let connector = Arc::new(HttpAgentConnector::new(AGENT_TIMEOUT));
    let clusters = Arc::new(
        ClusterManager::new(store.clone(), provider, connector)
            .with_health_policy(HealthPolicy::from(&config.cluster)),
    );
    info!(provider = ?config.provider.kind, host = %config.provider.host, "cluster manager initialized");

    let benchmarks = Arc::new(
        BenchmarkPipeline::new(store.clone(), Arc::clone(&clusters), Planner::default())
            .with_seeders(config.seeder.addrs.clone())
            .with_trace_ui(config.trace.ui_url().map(str::to_string)),
    );
    let experiments = Arc::new(
        ExperimentCoordinator::new(store.clone(), Arc::clone(&clusters), Arc::clone(&benchmarks))
            .with_max_concurrent_trials(config.experiment.max_concurrent_trials),
    );
    info!(
        seeders = config.seeder.addrs.len(),
        max_concurrent_trials = config.experiment.max_concurrent_trials,
        "benchmark pipeline initialized"
    );

    Ok(ApiState {
        store,
        clusters,
        benchmarks,
        experiments,
        supervisor: Arc::new(RunSupervisor::new()),
        shutdown: CancellationToken::new(),
    })
}

pub async fn run(config: LabdConfig) -> anyhow::Result<()> {
    info!("peerlab daemon starting");
    let state = assemble(&config)?;
    let shutdown = state.shutdown.clone();
    let supervisor = Arc::clone(&state.supervisor);
    let clusters = Arc::clone(&state.clusters);

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "API server starting");

    let router = peerlab_api::build_router(state);
    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            signal.cancel();
        })
        .await?;

    supervisor.shutdown(config.experiment.shutdown).await;

    match clusters.list(&Query::All) {
        Ok(left) if !left.is_empty() => {
            warn!(clusters = left.len(), "clusters still recorded at shutdown");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "could not list clusters at shutdown"),
    }

    info!("peerlab daemon stopped");
    Ok(())
}
