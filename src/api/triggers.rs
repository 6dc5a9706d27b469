/// External trigger endpoints
///
/// Start a run or re-enter a workflow at a specific node from an outside
/// event. The raw request body becomes the run payload.

use crate::api::{parse_payload, with_credential, AppState};
use crate::runtime::coordinator::ResumeOutcome;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde_json::json;

pub fn create_trigger_routes() -> Router<AppState> {
    Router::new()
        .route("/api/triggers/{workflow_id}", post(trigger_workflow))
        .route("/api/triggers/{workflow_id}/{node_id}", post(trigger_node))
}

/// POST /api/triggers/{workflow_id}
async fn trigger_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    tracing::info!("📥 Trigger received for workflow: {}", workflow_id);
    tracing::debug!("📄 Trigger body length: {}", body.len());

    let payload = match parse_payload(&body) {
        Ok(payload) => payload,
        Err(status) => return status.into_response(),
    };
    let payload = with_credential(
        &headers,
        payload,
        &state.coordinator.settings().credential_field,
    );

    match state
        .coordinator
        .start_workflow(&workflow_id, payload, Vec::new())
        .await
    {
        Ok(run_id) => Json(json!({
            "status": "triggered",
            "workflowId": workflow_id,
            "executionId": run_id,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/triggers/{workflow_id}/{node_id}
///
/// Joins the workflow's running run at `node_id` when there is one,
/// otherwise starts a new run there.
async fn trigger_node(
    State(state): State<AppState>,
    Path((workflow_id, node_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Response {
    tracing::info!("📥 Resume trigger received: {}/{}", workflow_id, node_id);

    let payload = match parse_payload(&body) {
        Ok(payload) => payload,
        Err(status) => return status.into_response(),
    };
    let payload = with_credential(
        &headers,
        payload,
        &state.coordinator.settings().credential_field,
    );

    match state
        .coordinator
        .resume_at_node(&workflow_id, &node_id, payload)
        .await
    {
        Ok(outcome) => {
            let status = match outcome {
                ResumeOutcome::Resumed { .. } => "resumed",
                ResumeOutcome::Started { .. } => "triggered",
            };
            (
                StatusCode::OK,
                Json(json!({
                    "status": status,
                    "workflowId": workflow_id,
                    "nodeId": node_id,
                    "executionId": outcome.run_id(),
                })),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}
