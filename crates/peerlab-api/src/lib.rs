//! peerlab-api — HTTP control API for labd.
//!
//! Every handler returns the entity's persisted snapshot wrapped in the
//! `{success, data, error}` envelope. Label and delete routes take
//! comma-joined lists; list routes take one query-language string.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v0/healthcheck` | Liveness |
//! | GET | `/api/v0/clusters/json?query=` | List clusters |
//! | GET | `/api/v0/clusters/{name}/json` | Get a cluster |
//! | POST | `/api/v0/clusters/create?name=` | Create a cluster (blocks until ready) |
//! | PUT | `/api/v0/clusters/label?names=&adds=&removes=` | Relabel clusters |
//! | DELETE | `/api/v0/clusters/delete?names=` | Destroy clusters |
//! | GET | `/api/v0/clusters/{name}/nodes/json?query=` | Query nodes |
//! | PUT | `/api/v0/clusters/{name}/nodes/label?query=&adds=&removes=` | Relabel matching nodes |
//! | GET | `/api/v0/clusters/{name}/nodes/{node}/json` | Get a node |
//! | GET | `/api/v0/scenarios/json?query=` | List scenarios |
//! | GET | `/api/v0/scenarios/{name}/json` | Get a scenario |
//! | POST | `/api/v0/scenarios/create?name=` | Create a scenario |
//! | PUT | `/api/v0/scenarios/label?names=&adds=&removes=` | Relabel scenarios |
//! | DELETE | `/api/v0/scenarios/delete?names=` | Delete scenarios |
//! | GET | `/api/v0/benchmarks/json?query=` | List benchmarks |
//! | GET | `/api/v0/benchmarks/{id}/json` | Get a benchmark |
//! | GET | `/api/v0/benchmarks/{id}/report/json` | Get a benchmark's report |
//! | POST | `/api/v0/benchmarks/create?cluster=&scenario=` | Start a benchmark |
//! | PUT | `/api/v0/benchmarks/{id}/cancel` | Cancel a running benchmark |
//! | PUT | `/api/v0/benchmarks/label?ids=&adds=&removes=` | Relabel benchmarks |
//! | DELETE | `/api/v0/benchmarks/delete?ids=` | Delete finished benchmarks |
//! | GET | `/api/v0/experiments/json?query=` | List experiments |
//! | GET | `/api/v0/experiments/{id}/json` | Get an experiment |
//! | POST | `/api/v0/experiments/create?no-reset=` | Start an experiment |
//! | PUT | `/api/v0/experiments/{id}/cancel` | Cancel a running experiment |
//! | PUT | `/api/v0/experiments/label?ids=&adds=&removes=` | Relabel experiments |
//! | DELETE | `/api/v0/experiments/delete?ids=` | Delete finished experiments |

pub mod commands;
pub mod extract;
pub mod handlers;
pub mod response;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use peerlab_cluster::ClusterManager;
use peerlab_experiment::{BenchmarkPipeline, ExperimentCoordinator, RunSupervisor};
use peerlab_state::StateStore;
use tokio_util::sync::CancellationToken;

pub use response::{ApiError, ApiResponse};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub clusters: Arc<ClusterManager>,
    pub benchmarks: Arc<BenchmarkPipeline>,
    pub experiments: Arc<ExperimentCoordinator>,
    pub supervisor: Arc<RunSupervisor>,
    /// Cancelled when the daemon stops; parents request-scoped work.
    pub shutdown: CancellationToken,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/healthcheck", get(handlers::healthcheck))
        .route("/clusters/json", get(handlers::list_clusters))
        .route("/clusters/create", post(handlers::create_cluster))
        .route("/clusters/label", put(handlers::label_clusters))
        .route("/clusters/delete", delete(handlers::delete_clusters))
        .route("/clusters/{name}/json", get(handlers::get_cluster))
        .route("/clusters/{name}/nodes/json", get(handlers::query_nodes))
        .route("/clusters/{name}/nodes/label", put(handlers::label_nodes))
        .route("/clusters/{name}/nodes/{node}/json", get(handlers::get_node))
        .route("/scenarios/json", get(handlers::list_scenarios))
        .route("/scenarios/create", post(handlers::create_scenario))
        .route("/scenarios/label", put(handlers::label_scenarios))
        .route("/scenarios/delete", delete(handlers::delete_scenarios))
        .route("/scenarios/{name}/json", get(handlers::get_scenario))
        .route("/benchmarks/json", get(handlers::list_benchmarks))
        .route("/benchmarks/create", post(handlers::create_benchmark))
        .route("/benchmarks/label", put(handlers::label_benchmarks))
        .route("/benchmarks/delete", delete(handlers::delete_benchmarks))
        .route("/benchmarks/{id}/json", get(handlers::get_benchmark))
        .route("/benchmarks/{id}/report/json", get(handlers::get_report))
        .route("/benchmarks/{id}/cancel", put(handlers::cancel_benchmark))
        .route("/experiments/json", get(handlers::list_experiments))
        .route("/experiments/create", post(handlers::create_experiment))
        .route("/experiments/label", put(handlers::label_experiments))
        .route("/experiments/delete", delete(handlers::delete_experiments))
        .route("/experiments/{id}/json", get(handlers::get_experiment))
        .route("/experiments/{id}/cancel", put(handlers::cancel_experiment))
        .with_state(state);

    Router::new().nest("/api/v0", api_routes)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode};
    use peerlab_cluster::HealthPolicy;
    use peerlab_cluster::fake::{FakeConnector, FakeProvider};
    use peerlab_scenario::Planner;
    use peerlab_state::TaskKind;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    struct TestApi {
        router: Router,
        connector: FakeConnector,
    }

    fn test_api() -> TestApi {
        let store = StateStore::open_in_memory().unwrap();
        let provider = FakeProvider::new();
        let connector = FakeConnector::new();
        let clusters = Arc::new(
            ClusterManager::new(
                store.clone(),
                Arc::new(provider),
                Arc::new(connector.clone()),
            )
            .with_health_policy(HealthPolicy {
                attempts: 1,
                interval: Duration::from_millis(1),
            }),
        );
        let benchmarks = Arc::new(BenchmarkPipeline::new(
            store.clone(),
            Arc::clone(&clusters),
            Planner::default(),
        ));
        let experiments = Arc::new(ExperimentCoordinator::new(
            store.clone(),
            Arc::clone(&clusters),
            Arc::clone(&benchmarks),
        ));
        let state = ApiState {
            store,
            clusters,
            benchmarks,
            experiments,
            supervisor: Arc::new(RunSupervisor::new()),
            shutdown: CancellationToken::new(),
        };
        TestApi {
            router: build_router(state),
            connector,
        }
    }

    async fn call(api: &TestApi, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = api.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn cluster_body(size: usize) -> Value {
        json!({
            "type": "groups",
            "groups": [{"size": size, "instance_type": "t2.micro", "region": "us-west-2"}]
        })
    }

    fn scenario_body() -> Value {
        json!({
            "objects": {"image": {"kind": "oci", "source": "alpine"}},
            "benchmark": {"region=us-west-2": "image"}
        })
    }

    async fn create_cluster(api: &TestApi, name: &str, size: usize) {
        let uri = format!("/api/v0/clusters/create?name={name}");
        let (status, _) = call(api, Method::POST, &uri, Some(cluster_body(size))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    async fn create_scenario(api: &TestApi, name: &str) {
        let uri = format!("/api/v0/scenarios/create?name={name}");
        let (status, _) = call(api, Method::POST, &uri, Some(scenario_body())).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    async fn wait_for_status(api: &TestApi, uri: &str, wanted: &str) -> Value {
        for _ in 0..200 {
            let (status, body) = call(api, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::OK);
            if body["data"]["status"] == wanted {
                return body["data"].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{uri} never reached {wanted}");
    }

    #[tokio::test]
    async fn healthcheck_answers() {
        let api = test_api();
        let (status, _) = call(&api, Method::GET, "/api/v0/healthcheck", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn cluster_create_get_and_list() {
        let api = test_api();
        create_cluster(&api, "c1", 2).await;

        let (status, body) = call(&api, Method::GET, "/api/v0/clusters/c1/json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "created");

        let (_, body) = call(&api, Method::GET, "/api/v0/clusters/json?query=c1", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        let (_, body) = call(&api, Method::GET, "/api/v0/clusters/json?query=nope", None).await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_statuses_follow_error_kind() {
        let api = test_api();
        create_cluster(&api, "c1", 1).await;

        let (status, body) = call(
            &api,
            Method::POST,
            "/api/v0/clusters/create?name=c1",
            Some(cluster_body(1)),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("c1"));

        let (status, _) = call(&api, Method::GET, "/api/v0/clusters/ghost/json", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&api, Method::GET, "/api/v0/clusters/json?query=%28", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &api,
            Method::POST,
            "/api/v0/clusters/create?name=empty",
            Some(cluster_body(0)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_input_gets_error_envelope() {
        let api = test_api();

        let (status, body) = call(
            &api,
            Method::POST,
            "/api/v0/clusters/create?name=x",
            Some(json!({"type": "bogus"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("invalid argument"));

        let (status, body) = call(
            &api,
            Method::POST,
            "/api/v0/clusters/create",
            Some(cluster_body(1)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(&api, Method::POST, "/api/v0/scenarios/create?name=s", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(
            &api,
            Method::POST,
            "/api/v0/benchmarks/create?cluster=c1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(
            &api,
            Method::POST,
            "/api/v0/experiments/create?no-reset=maybe",
            Some(json!({"trials": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (_, body) = call(&api, Method::GET, "/api/v0/clusters/json", None).await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn node_query_and_label() {
        let api = test_api();
        create_cluster(&api, "c1", 3).await;

        let (status, body) = call(&api, Method::GET, "/api/v0/clusters/c1/nodes/json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 3);

        let (status, body) = call(
            &api,
            Method::PUT,
            "/api/v0/clusters/c1/nodes/label?query=c1-0&adds=seeder",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (_, body) = call(&api, Method::GET, "/api/v0/clusters/c1/nodes/c1-0/json", None).await;
        let labels = body["data"]["labels"].as_array().unwrap();
        assert!(labels.contains(&json!("seeder")));

        let (_, body) = call(
            &api,
            Method::GET,
            "/api/v0/clusters/c1/nodes/json?query=seeder",
            None,
        )
        .await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cluster_label_and_delete() {
        let api = test_api();
        create_cluster(&api, "c1", 1).await;
        create_cluster(&api, "c2", 1).await;

        let (status, _) = call(
            &api,
            Method::PUT,
            "/api/v0/clusters/label?names=c1,c2&adds=baseline",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&api, Method::GET, "/api/v0/clusters/json?query=baseline", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let (status, body) = call(&api, Method::DELETE, "/api/v0/clusters/delete?names=c1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!(["c1"]));
        let (status, _) = call(&api, Method::GET, "/api/v0/clusters/c1/json", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scenario_crud() {
        let api = test_api();
        create_scenario(&api, "s1").await;

        let (status, body) = call(&api, Method::GET, "/api/v0/scenarios/s1/json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["definition"]["objects"]["image"]["kind"], "oci");

        let (status, _) = call(
            &api,
            Method::PUT,
            "/api/v0/scenarios/label?names=s1&adds=smoke",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&api, Method::GET, "/api/v0/scenarios/json?query=smoke", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, _) = call(&api, Method::DELETE, "/api/v0/scenarios/delete?names=s1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&api, Method::GET, "/api/v0/scenarios/s1/json", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn benchmark_runs_in_background() {
        let api = test_api();
        create_cluster(&api, "c1", 2).await;
        create_scenario(&api, "s1").await;

        let (status, body) = call(
            &api,
            Method::POST,
            "/api/v0/benchmarks/create?cluster=c1&scenario=s1&id=b1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["id"], "b1");

        wait_for_status(&api, "/api/v0/benchmarks/b1/json", "done").await;
        let (status, body) = call(&api, Method::GET, "/api/v0/benchmarks/b1/report/json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["nodes"].as_object().unwrap().len(), 2);

        let (status, _) = call(&api, Method::DELETE, "/api/v0/benchmarks/delete?ids=b1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&api, Method::GET, "/api/v0/benchmarks/b1/report/json", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn benchmark_on_missing_cluster_is_not_found() {
        let api = test_api();
        create_scenario(&api, "s1").await;
        let (status, _) = call(
            &api,
            Method::POST,
            "/api/v0/benchmarks/create?cluster=ghost&scenario=s1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn running_benchmark_cannot_be_deleted_until_cancelled() {
        let api = test_api();
        create_cluster(&api, "c1", 1).await;
        create_scenario(&api, "s1").await;
        api.connector.block_task("c1-0", TaskKind::Get);

        let (status, _) = call(
            &api,
            Method::POST,
            "/api/v0/benchmarks/create?cluster=c1&scenario=s1&id=b1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = call(&api, Method::DELETE, "/api/v0/benchmarks/delete?ids=b1", None).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);

        let (status, _) = call(&api, Method::PUT, "/api/v0/benchmarks/b1/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        let benchmark = wait_for_status(&api, "/api/v0/benchmarks/b1/json", "error").await;
        assert_eq!(benchmark["error"], "cancelled");

        let (status, _) = call(&api, Method::DELETE, "/api/v0/benchmarks/delete?ids=b1", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn experiment_runs_to_completion() {
        let api = test_api();
        let definition = json!({
            "trials": [
                {"cluster": cluster_body(2), "scenario": scenario_body()},
                {"cluster": cluster_body(1), "scenario": scenario_body()}
            ]
        });

        let (status, body) = call(
            &api,
            Method::POST,
            "/api/v0/experiments/create?no-reset=true",
            Some(definition),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let experiment = wait_for_status(&api, &format!("/api/v0/experiments/{id}/json"), "done").await;
        assert_eq!(experiment["benchmarks"].as_array().unwrap().len(), 2);

        let (_, body) = call(&api, Method::GET, "/api/v0/clusters/json", None).await;
        assert!(body["data"].as_array().unwrap().is_empty());

        let (status, _) = call(
            &api,
            Method::DELETE,
            &format!("/api/v0/experiments/delete?ids={id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_experiment_is_rejected() {
        let api = test_api();
        let (status, _) = call(
            &api,
            Method::POST,
            "/api/v0/experiments/create",
            Some(json!({"trials": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
