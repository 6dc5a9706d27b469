/// Error taxonomy for the execution coordinator
///
/// Infrastructure plumbing (storage, key-value store, ledger, dispatch) reports
/// `anyhow::Error`; the coordinator boundary classifies failures so that the
/// HTTP layer can tell client mistakes from run-terminal problems.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    // Client errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Node '{node_id}' not found in workflow '{workflow_id}'")]
    UnknownNode { workflow_id: String, node_id: String },

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    // Definition errors
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("No ready nodes found for run {0} - workflow may have circular dependencies")]
    NoReadyNodes(Uuid),

    // Infrastructure errors
    #[error("Execution state not found for run {0}")]
    StateNotFound(Uuid),

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl EngineError {
    /// Errors the caller caused and should not retry as-is.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::WorkflowNotFound(_)
                | EngineError::UnknownNode { .. }
                | EngineError::RunNotFound(_)
                | EngineError::InvalidDefinition(_)
                | EngineError::NoReadyNodes(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Infrastructure(e.into())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
