/// Run endpoints
///
/// Start a workflow run fire-and-forget or wait for its return payload, and
/// look up the durable record of any run.

use crate::{
    api::{with_credential, AppState},
    runtime::returns::{self, ReturnPayload, ReturnStatus},
    workflow::types::Variables,
};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// Request body shared by `/run` and `/run-sync`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
    pub payload: Variables,
    pub return_variables: Vec<String>,
    pub wait_for_completion: bool,
    pub timeout_ms: Option<u64>,
}

pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/run", post(run_workflow))
        .route("/api/workflows/{id}/run-sync", post(run_workflow_sync))
        .route("/api/runs/{run_id}", get(get_run))
}

/// POST /api/workflows/{id}/run
async fn run_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> Response {
    if request.wait_for_completion {
        return wait_for_run(&state, &workflow_id, &headers, request).await;
    }

    let payload = with_credential(
        &headers,
        request.payload,
        &state.coordinator.settings().credential_field,
    );

    match state
        .coordinator
        .start_workflow(&workflow_id, payload, request.return_variables.clone())
        .await
    {
        Ok(run_id) => Json(json!({
            "message": "Workflow execution initiated",
            "workflowId": workflow_id,
            "executionId": run_id,
            "status": "INITIATED",
            "waitForCompletion": false,
            "returnVariables": request.return_variables,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/workflows/{id}/run-sync
async fn run_workflow_sync(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> Response {
    wait_for_run(&state, &workflow_id, &headers, request).await
}

async fn wait_for_run(
    state: &AppState,
    workflow_id: &str,
    headers: &HeaderMap,
    request: RunRequest,
) -> Response {
    let payload = with_credential(
        headers,
        request.payload,
        &state.coordinator.settings().credential_field,
    );
    let timeout = request.timeout_ms.map(Duration::from_millis);

    let answer = match state
        .coordinator
        .run_and_wait(workflow_id, payload, request.return_variables.clone(), timeout)
        .await
    {
        Ok(answer) => answer,
        Err(e) if e.is_client_error() => return e.into_response(),
        Err(e) => {
            tracing::error!("❌ Synchronous run of '{}' failed: {}", workflow_id, e);
            ReturnPayload::new(
                None,
                ReturnStatus::Error,
                returns::extract_missing(&request.return_variables),
                Some(e.to_string()),
            )
        }
    };

    (sync_status(&answer), Json(answer)).into_response()
}

fn sync_status(answer: &ReturnPayload) -> StatusCode {
    match answer.status {
        ReturnStatus::Completed | ReturnStatus::Failed => StatusCode::OK,
        ReturnStatus::Timeout => StatusCode::REQUEST_TIMEOUT,
        ReturnStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /api/runs/{run_id}
async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let Ok(run_id) = Uuid::parse_str(&run_id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state.coordinator.run_record(run_id).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => e.into_response(),
    }
}
