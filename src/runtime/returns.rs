/// Return Variable Extractor
///
/// Selects the caller-requested subset of a run's accumulated state (or all of
/// it) when the run finishes. Extraction never fails: unknown names come back
/// as `null` and are listed as missing.

use crate::runtime::{kv::KeyValueStore, state::keys, state::ExecutionState};
use crate::workflow::types::Variables;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Result of projecting a run's namespace onto the requested names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedVariables {
    pub variables: Variables,
    /// Empty when everything was returned
    #[serde(default)]
    pub requested_variables: Vec<String>,
    #[serde(default)]
    pub missing_variables: Vec<String>,
}

/// Global variables overlaid by node outputs, last-completed node last
///
/// Outputs of nodes with no applied completion (partial results on timeout)
/// are folded first, in node id order, so completed nodes still win.
pub fn merged_namespace(state: &ExecutionState) -> Variables {
    let mut namespace = state.global_variables.clone();

    let mut pending: Vec<&String> = state
        .node_outputs
        .keys()
        .filter(|id| !state.completion_order.contains(id))
        .collect();
    pending.sort();

    let ordered = pending
        .into_iter()
        .chain(state.completion_order.iter());

    for node_id in ordered {
        if let Some(output) = state.node_outputs.get(node_id) {
            namespace.extend(output.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    namespace
}

/// Project the namespace onto `requested`, or return all of it when empty
pub fn extract(state: &ExecutionState, requested: &[String]) -> ExtractedVariables {
    let namespace = merged_namespace(state);

    if requested.is_empty() {
        return ExtractedVariables {
            variables: namespace,
            ..Default::default()
        };
    }

    let mut variables = Variables::new();
    let mut missing_variables = Vec::new();

    for name in requested {
        match namespace.get(name) {
            Some(value) => {
                variables.insert(name.clone(), value.clone());
            }
            None => {
                variables.insert(name.clone(), Value::Null);
                missing_variables.push(name.clone());
            }
        }
    }

    if !missing_variables.is_empty() {
        tracing::warn!(
            "❌ Requested return variables not found in run {}: {:?}",
            state.run_id,
            missing_variables
        );
    }

    ExtractedVariables {
        variables,
        requested_variables: requested.to_vec(),
        missing_variables,
    }
}

/// Requested-name projection when no state is left to read from
pub fn extract_missing(requested: &[String]) -> ExtractedVariables {
    ExtractedVariables {
        variables: requested
            .iter()
            .map(|name| (name.clone(), Value::Null))
            .collect(),
        requested_variables: requested.to_vec(),
        missing_variables: requested.to_vec(),
    }
}

/// Per-run registration of requested return variables
#[derive(Clone)]
pub struct ReturnVariableRegistry {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl ReturnVariableRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Register names for a run; an empty list registers nothing
    pub async fn register(&self, run_id: Uuid, names: &[String]) -> Result<()> {
        if names.is_empty() {
            tracing::debug!("No return variables specified for run {}", run_id);
            return Ok(());
        }

        let values = names.iter().cloned().map(Value::String).collect();
        self.kv
            .push(&keys::return_vars(run_id), values, self.ttl)
            .await?;

        tracing::info!("📋 Registered {} return variables for run {}", names.len(), run_id);
        Ok(())
    }

    /// Registered names; a read failure degrades to "return everything"
    pub async fn registered(&self, run_id: Uuid) -> Vec<String> {
        match self.kv.range(&keys::return_vars(run_id)).await {
            Ok(values) => values
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            Err(e) => {
                tracing::warn!("⚠️ Could not read return variables for run {}: {}", run_id, e);
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnStatus {
    Completed,
    Failed,
    Timeout,
    Error,
}

/// Answer handed to a synchronous caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnPayload {
    pub run_id: Option<Uuid>,
    pub status: ReturnStatus,
    pub variables: Variables,
    pub requested_variables: Vec<String>,
    pub returned_variable_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_variables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl ReturnPayload {
    pub fn new(
        run_id: Option<Uuid>,
        status: ReturnStatus,
        extracted: ExtractedVariables,
        error: Option<String>,
    ) -> Self {
        let ExtractedVariables {
            variables,
            requested_variables,
            missing_variables,
        } = extracted;

        Self {
            run_id,
            status,
            returned_variable_count: variables.len(),
            variables,
            requested_variables,
            missing_variables: (!missing_variables.is_empty()).then_some(missing_variables),
            error,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}
