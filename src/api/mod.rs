/// HTTP API Layer
///
/// This module provides the REST endpoints of the coordinator. It handles:
/// - Workflow CRUD operations with registry hot-reload
/// - Starting runs asynchronously or waiting for their result
/// - External triggers and resume-at-node
/// - Run record queries

use crate::error::EngineError;
use crate::workflow::types::Variables;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

// Workflow management endpoints (POST/GET/PUT/DELETE)
pub mod workflows;

// Run start, synchronous wait and run record lookup
pub mod runs;

// External trigger and resume endpoints
pub mod triggers;

// Re-export router builders
pub use runs::create_run_routes;
pub use triggers::create_trigger_routes;
pub use workflows::{create_workflow_routes, AppState};

/// Header whose value is threaded into the run payload as the credential
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::WorkflowNotFound(_)
            | EngineError::RunNotFound(_)
            | EngineError::UnknownNode { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidDefinition(_) | EngineError::NoReadyNodes(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::StateNotFound(_) | EngineError::Infrastructure(_) => {
                tracing::error!("❌ Request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Copy the access token header into the payload under `credential_field`
pub fn with_credential(headers: &HeaderMap, mut payload: Variables, credential_field: &str) -> Variables {
    if let Some(token) = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        payload.insert(credential_field.to_string(), Value::String(token.to_string()));
    }
    payload
}

/// Parse an optional JSON object body; empty means an empty payload
pub fn parse_payload(body: &str) -> Result<Variables, StatusCode> {
    if body.trim().is_empty() {
        return Ok(Variables::new());
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => {
            tracing::warn!("❌ Payload must be a JSON object");
            Err(StatusCode::BAD_REQUEST)
        }
        Err(e) => {
            tracing::warn!("❌ Invalid JSON payload: {}", e);
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn credential_header_is_copied_into_payload() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_TOKEN_HEADER, HeaderValue::from_static("tok"));

        let payload = with_credential(&headers, Variables::new(), "access_token");
        assert_eq!(payload["access_token"], Value::String("tok".into()));

        let untouched = with_credential(&HeaderMap::new(), Variables::new(), "access_token");
        assert!(untouched.is_empty());
    }

    #[test]
    fn payload_body_must_be_an_object() {
        assert!(parse_payload("").unwrap().is_empty());
        assert_eq!(parse_payload(r#"{"a":1}"#).unwrap()["a"], json!(1));
        assert_eq!(parse_payload("[1,2]"), Err(StatusCode::BAD_REQUEST));
        assert_eq!(parse_payload("{oops"), Err(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn engine_errors_map_to_status_codes() {
        let not_found = EngineError::WorkflowNotFound("wf".into()).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let invalid = EngineError::InvalidDefinition("cycle".into()).into_response();
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let infra = EngineError::Infrastructure(anyhow::anyhow!("db down")).into_response();
        assert_eq!(infra.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
