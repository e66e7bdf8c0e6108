//! Local lab regression tests.
//!
//! Drives the control API over real loopback agents: clusters come up
//! over HTTP, benchmarks and experiments run to completion, and nothing
//! is left running afterwards.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use peerlab_api::{ApiState, build_router};
use peerlab_cluster::{ClusterManager, HealthPolicy, HttpAgentConnector, LocalProvider, PortPool};
use peerlab_experiment::{BenchmarkPipeline, ExperimentCoordinator, RunSupervisor};
use peerlab_scenario::Planner;
use peerlab_state::StateStore;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct Lab {
    router: Router,
    provider: Arc<LocalProvider>,
    pool: Arc<PortPool>,
    _dir: tempfile::TempDir,
}

fn local_lab() -> Lab {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(&dir.path().join("labd.redb")).unwrap();
    let pool = Arc::new(PortPool::new("127.0.0.1"));
    let provider = Arc::new(LocalProvider::new("127.0.0.1", Arc::clone(&pool)));
    let clusters = Arc::new(
        ClusterManager::new(
            store.clone(),
            provider.clone(),
            Arc::new(HttpAgentConnector::new(Duration::from_secs(5))),
        )
        .with_health_policy(HealthPolicy {
            attempts: 20,
            interval: Duration::from_millis(50),
        }),
    );
    let benchmarks = Arc::new(
        BenchmarkPipeline::new(store.clone(), Arc::clone(&clusters), Planner::default())
            .with_trace_ui(Some("http://traces.local".to_string())),
    );
    let experiments = Arc::new(ExperimentCoordinator::new(
        store.clone(),
        Arc::clone(&clusters),
        Arc::clone(&benchmarks),
    ));
    let router = build_router(ApiState {
        store,
        clusters,
        benchmarks,
        experiments,
        supervisor: Arc::new(RunSupervisor::new()),
        shutdown: CancellationToken::new(),
    });
    Lab {
        router,
        provider,
        pool,
        _dir: dir,
    }
}

async fn call(lab: &Lab, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = lab.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_for(lab: &Lab, uri: &str, wanted: &str) -> Value {
    for _ in 0..300 {
        let (_, body) = call(lab, Method::GET, uri, None).await;
        if body["data"]["status"] == wanted {
            return body["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{uri} never reached {wanted}");
}

fn cluster(size: usize) -> Value {
    json!({
        "type": "groups",
        "groups": [{"size": size, "instance_type": "local", "region": "loopback"}]
    })
}

fn scenario() -> Value {
    json!({
        "objects": {"image": {"kind": "oci", "source": "docker.io/library/alpine:3"}},
        "seed": {"region=loopback": "image"},
        "benchmark": {"region=loopback": "image"}
    })
}

#[tokio::test]
async fn benchmark_over_loopback_agents() {
    let lab = local_lab();

    let (status, body) = call(
        &lab,
        Method::POST,
        "/api/v0/clusters/create?name=lab1",
        Some(cluster(2)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "created");
    assert_eq!(lab.provider.running_agents("lab1"), 2);

    let (status, _) = call(
        &lab,
        Method::POST,
        "/api/v0/scenarios/create?name=pull",
        Some(scenario()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = call(
        &lab,
        Method::POST,
        "/api/v0/benchmarks/create?cluster=lab1&scenario=pull&id=run1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for(&lab, "/api/v0/benchmarks/run1/json", "done").await;

    let (status, body) = call(&lab, Method::GET, "/api/v0/benchmarks/run1/report/json", None).await;
    assert_eq!(status, StatusCode::OK);
    let report = &body["data"];
    assert_eq!(report["nodes"].as_object().unwrap().len(), 2);
    assert!(
        report["summary"]["trace"]
            .as_str()
            .unwrap()
            .starts_with("http://traces.local/trace/")
    );

    let (status, _) = call(&lab, Method::DELETE, "/api/v0/clusters/delete?names=lab1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lab.provider.running_agents("lab1"), 0);
    assert_eq!(lab.pool.in_use(), 0);
}

#[tokio::test]
async fn experiment_over_loopback_agents() {
    let lab = local_lab();
    let definition = json!({
        "trials": [
            {"cluster": cluster(1), "scenario": scenario()},
            {"cluster": cluster(2), "scenario": scenario()}
        ]
    });

    let (status, body) = call(
        &lab,
        Method::POST,
        "/api/v0/experiments/create",
        Some(definition),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let experiment = wait_for(&lab, &format!("/api/v0/experiments/{id}/json"), "done").await;
    let benchmarks = experiment["benchmarks"].as_array().unwrap();
    assert_eq!(benchmarks.len(), 2);

    let (_, body) = call(
        &lab,
        Method::GET,
        &format!("/api/v0/benchmarks/json?query={id}-0%20or%20{id}-1"),
        None,
    )
    .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (_, body) = call(&lab, Method::GET, "/api/v0/clusters/json", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
    assert_eq!(lab.pool.in_use(), 0);
}
