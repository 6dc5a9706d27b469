/// Hot-reload workflow registry using ArcSwap
///
/// Lock-free reads of the current definitions; every update swaps the whole
/// map. Runs hold an `Arc<Workflow>` snapshot, so a reload never touches a
/// definition that is already executing.

use crate::error::{EngineError, EngineResult};
use crate::workflow::{storage::WorkflowStorage, types::Workflow};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug)]
pub struct WorkflowRegistry {
    /// Key: workflow_id, Value: validated definition snapshot
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,
    storage: WorkflowStorage,
}

/// Validated workflow ready for execution
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    /// Immutable definition snapshot handed to each new run
    pub workflow: Arc<Workflow>,
    /// Nodes without predecessors, in definition order
    pub root_node_ids: Vec<String>,
}

impl WorkflowRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Populate the registry from storage at startup
    ///
    /// Definitions that fail validation are logged and left out rather than
    /// blocking startup.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_workflows().await?;
        let mut compiled = HashMap::new();

        for (id, workflow) in stored {
            match compile(workflow) {
                Ok(c) => {
                    compiled.insert(id, c);
                }
                Err(e) => tracing::warn!("⚠️ Not loading workflow '{}': {}", id, e),
            }
        }

        self.workflows.store(Arc::new(compiled));

        tracing::info!(
            "Initialized workflow registry with {} workflows",
            self.workflows.load().len()
        );

        Ok(())
    }

    /// Reload one workflow from storage into the registry
    pub async fn reload_workflow(&self, workflow_id: &str) -> EngineResult<()> {
        let workflow = self
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        self.insert(compile(workflow)?);

        tracing::info!("Hot-reloaded workflow: {}", workflow_id);
        Ok(())
    }

    /// Validate and publish a definition without going through storage
    pub fn register(&self, workflow: Workflow) -> EngineResult<()> {
        self.insert(compile(workflow)?);
        Ok(())
    }

    fn insert(&self, compiled: CompiledWorkflow) {
        let current = self.workflows.load();
        let mut next = (**current).clone();
        next.insert(compiled.workflow.id.clone(), compiled);
        self.workflows.store(Arc::new(next));
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// Snapshot of the current definition for a new run
    pub fn snapshot(&self, workflow_id: &str) -> EngineResult<Arc<Workflow>> {
        self.get_workflow(workflow_id)
            .map(|c| c.workflow)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn remove_workflow(&self, workflow_id: &str) {
        let current = self.workflows.load();
        let mut next = (**current).clone();

        if next.remove(workflow_id).is_some() {
            self.workflows.store(Arc::new(next));
            tracing::info!("Removed workflow from registry: {}", workflow_id);
        }
    }
}

/// Validate structure and acyclicity, then extract root nodes
pub fn compile(workflow: Workflow) -> EngineResult<CompiledWorkflow> {
    workflow.validate()?;

    if workflow.has_cycle() {
        return Err(EngineError::InvalidDefinition(format!(
            "Workflow '{}' contains cycles - must be a DAG",
            workflow.id
        )));
    }

    let root_node_ids = workflow
        .nodes
        .iter()
        .filter(|n| !workflow.edges.iter().any(|e| e.target == n.id))
        .map(|n| n.id.clone())
        .collect();

    Ok(CompiledWorkflow {
        workflow: Arc::new(workflow),
        root_node_ids,
    })
}
