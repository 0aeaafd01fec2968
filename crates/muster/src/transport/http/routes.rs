//! HTTP route handlers for the coordinator front-end.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::forwarder::ForwardError;
use crate::job::TrainingSpec;
use crate::service::{CoordinatorService, NodeSummary, SubmitError, TrainOutcome};

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainRequest {
    #[serde(default, alias = "node")]
    pub worker_name: Option<String>,
    pub model_name: String,
    pub model_type: String,
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    #[serde(alias = "node")]
    pub worker_name: String,
    pub image_path: String,
    pub model_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactQuery {
    #[serde(alias = "node")]
    pub worker_name: String,
    pub artifact_name: String,
}

pub fn routes(service: Arc<CoordinatorService>) -> Router {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/train", post(train))
        .route("/inference", post(inference))
        .route("/artifact", get(artifact))
        .with_state(service)
}

async fn list_nodes(State(service): State<Arc<CoordinatorService>>) -> Json<NodesResponse> {
    Json(NodesResponse {
        nodes: service.list_nodes(),
    })
}

async fn train(
    State(service): State<Arc<CoordinatorService>>,
    Json(req): Json<TrainRequest>,
) -> Response {
    let spec = TrainingSpec {
        model_name: req.model_name,
        model_type: req.model_type,
        epochs: req.epochs,
        batch_size: req.batch_size,
        learning_rate: req.learning_rate,
    };

    match service.submit_training(req.worker_name, spec).await {
        Ok(TrainOutcome::Completed(payload)) => Json(payload).into_response(),
        Ok(TrainOutcome::Initiated) => {
            Json(json!({ "status": "Training initiated" })).into_response()
        }
        Err(err) => submit_error_response(err),
    }
}

async fn inference(
    State(service): State<Arc<CoordinatorService>>,
    Json(req): Json<InferenceRequest>,
) -> Response {
    match service
        .submit_inference(&req.worker_name, &req.image_path, &req.model_name)
        .await
    {
        Ok(payload) => {
            if payload_error(&payload).is_some() {
                (StatusCode::BAD_GATEWAY, Json(payload)).into_response()
            } else {
                Json(payload).into_response()
            }
        }
        Err(err) => submit_error_response(err),
    }
}

async fn artifact(
    State(service): State<Arc<CoordinatorService>>,
    Query(query): Query<ArtifactQuery>,
) -> Response {
    match service
        .fetch_artifact(&query.worker_name, &query.artifact_name)
        .await
    {
        Ok(payload) => {
            if payload_error(&payload).is_some() {
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            } else {
                Json(payload).into_response()
            }
        }
        Err(err) => submit_error_response(err),
    }
}

/// Failure payloads fulfilled by a worker ERROR message carry an
/// "error" field instead of artifact data.
fn payload_error(payload: &serde_json::Value) -> Option<&str> {
    payload.get("error").and_then(serde_json::Value::as_str)
}

fn submit_error_response(err: SubmitError) -> Response {
    let status = match &err {
        SubmitError::Forward(ForwardError::NoNodesAvailable) => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::Forward(ForwardError::NodeNotFound(_)) => StatusCode::NOT_FOUND,
        SubmitError::Forward(ForwardError::Send { .. }) => StatusCode::BAD_GATEWAY,
        SubmitError::Timeout => StatusCode::GATEWAY_TIMEOUT,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
