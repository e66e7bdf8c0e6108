//! HTTP handlers: extract parameters, build a command, run it.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use peerlab_core::{LabResult, split_list};
use peerlab_experiment::TrialOptions;
use peerlab_query::{Query, parse};
use peerlab_state::{ClusterDefinition, ExperimentDefinition, ScenarioDefinition};
use serde::Deserialize;

use crate::ApiState;
use crate::extract::{ApiJson, ApiQuery};
use crate::commands::{
    BenchmarkCommand, ClusterCommand, ExperimentCommand, NodeCommand, Relabel, Reply,
    ScenarioCommand,
};
use crate::response::{ApiError, ApiResponse};

fn respond(result: LabResult<Reply>, status: StatusCode) -> Response {
    match result {
        Ok(reply) => (status, ApiResponse::ok(reply)).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// `?query=` on list endpoints. Absent or blank matches everything.
#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub query: String,
}

impl QueryParams {
    fn parse(&self) -> Result<Query, ApiError> {
        parse(&self.query).map_err(|e| ApiError(e.into()))
    }
}

/// Comma-joined ids plus label edits.
#[derive(Debug, Default, Deserialize)]
pub struct LabelParams {
    #[serde(default, alias = "ids")]
    pub names: String,
    #[serde(default)]
    pub adds: String,
    #[serde(default)]
    pub removes: String,
}

impl From<LabelParams> for Relabel {
    fn from(p: LabelParams) -> Self {
        Relabel {
            ids: split_list(&p.names),
            adds: split_list(&p.adds),
            removes: split_list(&p.removes),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NameParams {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct NamesParams {
    #[serde(default, alias = "ids")]
    pub names: String,
}

#[derive(Debug, Deserialize)]
pub struct NodeLabelParams {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub adds: String,
    #[serde(default)]
    pub removes: String,
}

#[derive(Debug, Deserialize)]
pub struct BenchmarkParams {
    pub cluster: String,
    pub scenario: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExperimentParams {
    #[serde(default, rename = "no-reset")]
    pub no_reset: bool,
}

pub async fn healthcheck() -> StatusCode {
    StatusCode::OK
}

// ── Clusters ───────────────────────────────────────────────────

/// GET /api/v0/clusters/json
pub async fn list_clusters(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<QueryParams>,
) -> Result<Response, ApiError> {
    let query = params.parse()?;
    Ok(respond(
        ClusterCommand::List { query }.execute(&state).await,
        StatusCode::OK,
    ))
}

/// GET /api/v0/clusters/{name}/json
pub async fn get_cluster(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    respond(ClusterCommand::Get { name }.execute(&state).await, StatusCode::OK)
}

/// POST /api/v0/clusters/create?name=
pub async fn create_cluster(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<NameParams>,
    ApiJson(definition): ApiJson<ClusterDefinition>,
) -> Response {
    let command = ClusterCommand::Create {
        name: params.name,
        definition,
    };
    respond(command.execute(&state).await, StatusCode::CREATED)
}

/// PUT /api/v0/clusters/label
pub async fn label_clusters(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<LabelParams>,
) -> Response {
    respond(
        ClusterCommand::Label(params.into()).execute(&state).await,
        StatusCode::OK,
    )
}

/// DELETE /api/v0/clusters/delete
pub async fn delete_clusters(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<NamesParams>,
) -> Response {
    let names = split_list(&params.names);
    respond(
        ClusterCommand::Delete { names }.execute(&state).await,
        StatusCode::OK,
    )
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v0/clusters/{name}/nodes/json
pub async fn query_nodes(
    State(state): State<ApiState>,
    Path(cluster): Path<String>,
    ApiQuery(params): ApiQuery<QueryParams>,
) -> Result<Response, ApiError> {
    let query = params.parse()?;
    Ok(respond(
        NodeCommand::Query { cluster, query }.execute(&state),
        StatusCode::OK,
    ))
}

/// GET /api/v0/clusters/{name}/nodes/{node}/json
pub async fn get_node(
    State(state): State<ApiState>,
    Path((cluster, node)): Path<(String, String)>,
) -> Response {
    respond(NodeCommand::Get { cluster, node }.execute(&state), StatusCode::OK)
}

/// PUT /api/v0/clusters/{name}/nodes/label
pub async fn label_nodes(
    State(state): State<ApiState>,
    Path(cluster): Path<String>,
    ApiQuery(params): ApiQuery<NodeLabelParams>,
) -> Result<Response, ApiError> {
    let query = parse(&params.query).map_err(|e| ApiError(e.into()))?;
    let command = NodeCommand::Label {
        cluster,
        query,
        adds: split_list(&params.adds),
        removes: split_list(&params.removes),
    };
    Ok(respond(command.execute(&state), StatusCode::OK))
}

// ── Scenarios ──────────────────────────────────────────────────

/// GET /api/v0/scenarios/json
pub async fn list_scenarios(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<QueryParams>,
) -> Result<Response, ApiError> {
    let query = params.parse()?;
    Ok(respond(
        ScenarioCommand::List { query }.execute(&state),
        StatusCode::OK,
    ))
}

/// GET /api/v0/scenarios/{name}/json
pub async fn get_scenario(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    respond(ScenarioCommand::Get { name }.execute(&state), StatusCode::OK)
}

/// POST /api/v0/scenarios/create?name=
pub async fn create_scenario(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<NameParams>,
    ApiJson(definition): ApiJson<ScenarioDefinition>,
) -> Response {
    let command = ScenarioCommand::Create {
        name: params.name,
        definition,
    };
    respond(command.execute(&state), StatusCode::CREATED)
}

/// PUT /api/v0/scenarios/label
pub async fn label_scenarios(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<LabelParams>,
) -> Response {
    respond(
        ScenarioCommand::Label(params.into()).execute(&state),
        StatusCode::OK,
    )
}

/// DELETE /api/v0/scenarios/delete
pub async fn delete_scenarios(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<NamesParams>,
) -> Response {
    let names = split_list(&params.names);
    respond(
        ScenarioCommand::Delete { names }.execute(&state),
        StatusCode::OK,
    )
}

// ── Benchmarks ─────────────────────────────────────────────────

/// GET /api/v0/benchmarks/json
pub async fn list_benchmarks(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<QueryParams>,
) -> Result<Response, ApiError> {
    let query = params.parse()?;
    Ok(respond(
        BenchmarkCommand::List { query }.execute(&state),
        StatusCode::OK,
    ))
}

/// GET /api/v0/benchmarks/{id}/json
pub async fn get_benchmark(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(BenchmarkCommand::Get { id }.execute(&state), StatusCode::OK)
}

/// GET /api/v0/benchmarks/{id}/report/json
pub async fn get_report(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(BenchmarkCommand::Report { id }.execute(&state), StatusCode::OK)
}

/// POST /api/v0/benchmarks/create?cluster=&scenario=
///
/// Answers with the running record; the run continues in the background.
pub async fn create_benchmark(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<BenchmarkParams>,
) -> Response {
    let command = BenchmarkCommand::Create {
        id: params.id,
        cluster: params.cluster,
        scenario: params.scenario,
    };
    respond(command.execute(&state), StatusCode::ACCEPTED)
}

/// PUT /api/v0/benchmarks/{id}/cancel
pub async fn cancel_benchmark(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(BenchmarkCommand::Cancel { id }.execute(&state), StatusCode::OK)
}

/// PUT /api/v0/benchmarks/label
pub async fn label_benchmarks(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<LabelParams>,
) -> Response {
    respond(
        BenchmarkCommand::Label(params.into()).execute(&state),
        StatusCode::OK,
    )
}

/// DELETE /api/v0/benchmarks/delete
pub async fn delete_benchmarks(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<NamesParams>,
) -> Response {
    let ids = split_list(&params.names);
    respond(BenchmarkCommand::Delete { ids }.execute(&state), StatusCode::OK)
}

// ── Experiments ────────────────────────────────────────────────

/// GET /api/v0/experiments/json
pub async fn list_experiments(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<QueryParams>,
) -> Result<Response, ApiError> {
    let query = params.parse()?;
    Ok(respond(
        ExperimentCommand::List { query }.execute(&state),
        StatusCode::OK,
    ))
}

/// GET /api/v0/experiments/{id}/json
pub async fn get_experiment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(ExperimentCommand::Get { id }.execute(&state), StatusCode::OK)
}

/// POST /api/v0/experiments/create
pub async fn create_experiment(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<ExperimentParams>,
    ApiJson(definition): ApiJson<ExperimentDefinition>,
) -> Response {
    let command = ExperimentCommand::Create {
        definition,
        options: TrialOptions {
            reset: !params.no_reset,
        },
    };
    respond(command.execute(&state), StatusCode::ACCEPTED)
}

/// PUT /api/v0/experiments/{id}/cancel
pub async fn cancel_experiment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(ExperimentCommand::Cancel { id }.execute(&state), StatusCode::OK)
}

/// PUT /api/v0/experiments/label
pub async fn label_experiments(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<LabelParams>,
) -> Response {
    respond(
        ExperimentCommand::Label(params.into()).execute(&state),
        StatusCode::OK,
    )
}

/// DELETE /api/v0/experiments/delete
pub async fn delete_experiments(
    State(state): State<ApiState>,
    ApiQuery(params): ApiQuery<NamesParams>,
) -> Response {
    let ids = split_list(&params.names);
    respond(ExperimentCommand::Delete { ids }.execute(&state), StatusCode::OK)
}
