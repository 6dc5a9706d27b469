/// Workflow execution coordinator
///
/// Drives every run as a small state machine, `RUNNING -> COMPLETED | FAILED`:
/// start builds and persists the graph and dispatches the initial ready set,
/// each completion event advances the graph and dispatches what it released,
/// and the last terminal node finalizes the run into the ledger.
///
/// Every path that touches a run's graph or state holds that run's lock from
/// the first read to the last replace, so sibling completions arriving
/// concurrently from different workers are applied one at a time.

use crate::error::{EngineError, EngineResult};
use crate::runtime::{
    dispatch::{
        CompletionStatus, DispatchChannel, DispatchPriority, NodeCompletionEvent,
        NodeExecutionRequest,
    },
    graph::DependencyGraph,
    ledger::{wait_for_terminal, RunLedger, RunRecord, RunStatus, WaitOutcome},
    returns::{self, ExtractedVariables, ReturnPayload, ReturnStatus, ReturnVariableRegistry},
    state::{redact_credential, ExecutionState, ExecutionStateStore, RunLocks},
};
use crate::workflow::{
    registry::WorkflowRegistry,
    types::{Variables, Workflow},
};
use chrono::Utc;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Tunables the coordinator reads from configuration
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Payload field holding a bearer credential for downstream nodes
    pub credential_field: String,
    pub wait_poll_interval: Duration,
    pub default_wait_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            credential_field: "access_token".to_string(),
            wait_poll_interval: Duration::from_millis(1000),
            default_wait_timeout: Duration::from_millis(300_000),
        }
    }
}

/// What applying one completion event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Newly ready nodes were dispatched
    Advanced(Vec<String>),
    /// Nothing became ready yet; other branches are still in flight
    Idle,
    /// The run reached a terminal status
    Finalized(RunStatus),
    /// The node's completion was already applied
    Duplicate,
    /// The event arrived after the run was finalized, or names an unknown node
    Ignored,
}

/// How a resume request was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Merged into the workflow's RUNNING run
    Resumed { run_id: Uuid },
    /// No run was active; a new one was started at the node
    Started { run_id: Uuid },
}

impl ResumeOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            ResumeOutcome::Resumed { run_id } | ResumeOutcome::Started { run_id } => *run_id,
        }
    }
}

pub struct Coordinator {
    registry: Arc<WorkflowRegistry>,
    state: ExecutionStateStore,
    returns: ReturnVariableRegistry,
    ledger: Arc<dyn RunLedger>,
    channel: Arc<dyn DispatchChannel>,
    locks: RunLocks,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        state: ExecutionStateStore,
        ledger: Arc<dyn RunLedger>,
        channel: Arc<dyn DispatchChannel>,
        settings: CoordinatorSettings,
    ) -> Self {
        let returns = ReturnVariableRegistry::new(state.kv(), state.ttl());
        Self {
            registry,
            state,
            returns,
            ledger,
            channel,
            locks: RunLocks::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    pub fn state_store(&self) -> &ExecutionStateStore {
        &self.state
    }

    /// Start a run of the registered workflow `workflow_id`
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        payload: Variables,
        return_variables: Vec<String>,
    ) -> EngineResult<Uuid> {
        let snapshot = self.registry.snapshot(workflow_id)?;
        self.start(snapshot, payload, return_variables).await
    }

    /// Start a run against a definition snapshot and return its id
    ///
    /// Returns as soon as the initial ready nodes are dispatched; everything
    /// after that is driven by completion events.
    pub async fn start(
        &self,
        workflow: Arc<Workflow>,
        payload: Variables,
        return_variables: Vec<String>,
    ) -> EngineResult<Uuid> {
        self.start_run(workflow, payload, return_variables, None).await
    }

    async fn start_run(
        &self,
        workflow: Arc<Workflow>,
        payload: Variables,
        return_variables: Vec<String>,
        entry_node: Option<&str>,
    ) -> EngineResult<Uuid> {
        let run_id = Uuid::new_v4();
        let redacted = redact_credential(&payload, &self.settings.credential_field);

        tracing::info!(
            "🚀 Starting run {} of workflow '{}' (payload keys: {}, return variables: {:?})",
            run_id,
            workflow.id,
            payload.len(),
            return_variables
        );
        tracing::debug!("📥 Payload for run {}: {:?}", run_id, redacted);

        let guard = self.locks.acquire(run_id).await;

        let record = RunRecord::running(
            run_id,
            &workflow.id,
            workflow.owner_id.clone(),
            Value::Object(redacted),
        );
        self.ledger.create(&record).await?;

        let result = self
            .initialize_run(run_id, &workflow, payload, &return_variables, entry_node)
            .await;

        if let Err(e) = &result {
            tracing::error!("❌ Failed to start run {} of '{}': {}", run_id, workflow.id, e);
            self.fail_run(run_id, &e.to_string()).await;
        }

        drop(guard);
        self.locks.prune(run_id).await;

        result.map(|ready| {
            tracing::info!(
                "✅ Run {} started with {} initial ready node(s): {:?}",
                run_id,
                ready.len(),
                ready
            );
            run_id
        })
    }

    async fn initialize_run(
        &self,
        run_id: Uuid,
        workflow: &Workflow,
        payload: Variables,
        return_variables: &[String],
        entry_node: Option<&str>,
    ) -> EngineResult<Vec<String>> {
        workflow.validate()?;

        let mut graph = DependencyGraph::build(workflow);
        if let Some(entry) = entry_node {
            graph.scope_to_entry(entry);
        }

        self.state.save_definition(run_id, workflow).await?;
        let state = self.state.create(run_id, workflow, payload).await?;
        self.returns.register(run_id, return_variables).await?;

        let ready = graph.initial_ready();
        if ready.is_empty() {
            return Err(EngineError::NoReadyNodes(run_id));
        }
        if entry_node.is_none() && workflow.has_cycle() {
            return Err(EngineError::InvalidDefinition(format!(
                "Workflow '{}' contains cycles - must be a DAG",
                workflow.id
            )));
        }

        graph.mark_dispatched(ready.iter().cloned());
        self.state.save_graph(run_id, &graph).await?;
        self.state.register_ready(run_id, &ready).await?;

        self.dispatch_nodes(workflow, &graph, &state, &ready).await?;
        Ok(ready)
    }

    /// Build input contexts and hand each node to its category's workers
    async fn dispatch_nodes(
        &self,
        workflow: &Workflow,
        graph: &DependencyGraph,
        state: &ExecutionState,
        node_ids: &[String],
    ) -> EngineResult<()> {
        for node_id in node_ids {
            let Some(node) = workflow.node(node_id) else {
                tracing::warn!(
                    "⚠️ Ready node '{}' missing from snapshot of '{}'",
                    node_id,
                    workflow.id
                );
                continue;
            };

            let input_context = build_input_context(graph, state, node_id);
            let credential = input_context
                .get(&self.settings.credential_field)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string);

            let request = NodeExecutionRequest {
                run_id: state.run_id,
                workflow_id: workflow.id.clone(),
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                node_data: node.data.clone(),
                input_context,
                predecessor_ids: graph.predecessors(node_id).to_vec(),
                timestamp: Utc::now(),
                priority: DispatchPriority::Normal,
                credential,
            };

            self.channel.dispatch(node.category, request).await?;
        }
        Ok(())
    }

    /// Apply one completion event
    ///
    /// Processing failures fail the run and clear its ephemeral state; the
    /// error is still returned so the consumer can log it.
    pub async fn handle_completion(
        &self,
        event: &NodeCompletionEvent,
    ) -> EngineResult<CompletionOutcome> {
        let run_id = event.run_id;
        tracing::info!(
            "📨 Completion for node {} of run {}: {:?} ({}ms)",
            event.node_id,
            run_id,
            event.status,
            event.processing_time_ms
        );

        let guard = self.locks.acquire(run_id).await;
        let result = self.apply_completion(event).await;

        if let Err(e) = &result {
            if !matches!(e, EngineError::RunNotFound(_)) {
                tracing::error!(
                    "❌ Completion processing failed for node {} of run {}: {}",
                    event.node_id,
                    run_id,
                    e
                );
                self.fail_run(run_id, &format!("Node completion processing failed: {}", e))
                    .await;
            }
        }

        drop(guard);
        self.locks.prune(run_id).await;
        result
    }

    async fn apply_completion(
        &self,
        event: &NodeCompletionEvent,
    ) -> EngineResult<CompletionOutcome> {
        let run_id = event.run_id;
        let node_id = event.node_id.as_str();

        let Some(mut state) = self.state.get(run_id).await? else {
            return self.late_completion(event).await;
        };
        let mut graph = self
            .state
            .load_graph(run_id)
            .await?
            .ok_or(EngineError::StateNotFound(run_id))?;

        if !graph.contains(node_id) {
            tracing::warn!("⚠️ Completion names unknown node {} in run {}", node_id, run_id);
            return Ok(CompletionOutcome::Ignored);
        }
        if graph.is_terminal(node_id) {
            tracing::warn!(
                "⚠️ Duplicate completion for node {} in run {}; ignoring",
                node_id,
                run_id
            );
            return Ok(CompletionOutcome::Duplicate);
        }

        match event.status {
            CompletionStatus::Completed => {
                if !event.output.is_empty() {
                    state.merge_node_output(node_id, event.output.clone());
                }
                state.record_completion(node_id);

                let ready = graph.on_completed(node_id);
                graph.mark_dispatched(ready.iter().cloned());

                self.state.replace(&state).await?;
                self.state.save_graph(run_id, &graph).await?;

                if !ready.is_empty() {
                    tracing::info!("➡️ Ready after {}: {:?}", node_id, ready);
                    self.state.register_ready(run_id, &ready).await?;
                    let workflow = self.load_snapshot(run_id).await?;
                    self.dispatch_nodes(&workflow, &graph, &state, &ready).await?;
                    return Ok(CompletionOutcome::Advanced(ready));
                }
            }
            CompletionStatus::Failed => {
                let error = event
                    .error
                    .clone()
                    .unwrap_or_else(|| "Node execution failed".to_string());
                tracing::warn!("⚠️ Node {} of run {} failed: {}", node_id, run_id, error);

                state.record_failure(node_id, error);
                graph.on_failed(node_id);

                self.state.replace(&state).await?;
                self.state.save_graph(run_id, &graph).await?;
            }
        }

        if graph.is_complete() {
            let status = self.finalize(&state, &graph).await?;
            return Ok(CompletionOutcome::Finalized(status));
        }

        tracing::debug!("No new ready nodes after {} in run {}", node_id, run_id);
        Ok(CompletionOutcome::Idle)
    }

    /// Event for a run whose ephemeral state is gone
    async fn late_completion(
        &self,
        event: &NodeCompletionEvent,
    ) -> EngineResult<CompletionOutcome> {
        match self.ledger.get(event.run_id).await? {
            Some(record) if record.status.is_terminal() => {
                tracing::debug!(
                    "Ignoring completion for node {} of finished run {}",
                    event.node_id,
                    event.run_id
                );
                Ok(CompletionOutcome::Ignored)
            }
            Some(_) => Err(EngineError::StateNotFound(event.run_id)),
            None => Err(EngineError::RunNotFound(event.run_id)),
        }
    }

    async fn load_snapshot(&self, run_id: Uuid) -> EngineResult<Workflow> {
        self.state
            .load_definition(run_id)
            .await?
            .ok_or(EngineError::StateNotFound(run_id))
    }

    /// Extract return variables, write the terminal record, clear state
    async fn finalize(
        &self,
        state: &ExecutionState,
        graph: &DependencyGraph,
    ) -> EngineResult<RunStatus> {
        let run_id = state.run_id;
        let requested = self.returns.registered(run_id).await;
        let extracted = returns::extract(state, &requested);
        let output = serde_json::to_value(&extracted)?;

        let status = if graph.has_failures() {
            let error = failure_summary(state);
            self.ledger.fail(run_id, &error, Some(output)).await?;
            tracing::error!("❌ Run {} finished FAILED: {}", run_id, error);
            RunStatus::Failed
        } else {
            self.ledger.complete(run_id, output).await?;
            tracing::info!(
                "🏁 Run {} completed with {} returned variable(s)",
                run_id,
                extracted.variables.len()
            );
            RunStatus::Completed
        };

        if let Err(e) = self.state.clear(run_id).await {
            tracing::warn!("⚠️ Could not clear state for run {}: {}", run_id, e);
        }
        Ok(status)
    }

    /// Terminal failure outside the normal completion path; best effort
    async fn fail_run(&self, run_id: Uuid, error: &str) {
        if let Err(e) = self.ledger.fail(run_id, error, None).await {
            tracing::error!("❌ Could not mark run {} failed: {}", run_id, e);
        }
        if let Err(e) = self.state.clear(run_id).await {
            tracing::warn!("⚠️ Could not clear state for run {}: {}", run_id, e);
        }
    }

    /// Re-enter a workflow at `node_id`, ignoring the node's predecessors
    ///
    /// Joins the workflow's most recent RUNNING run when there is one,
    /// otherwise starts a new run whose only ready node is `node_id`.
    pub async fn resume_at_node(
        &self,
        workflow_id: &str,
        node_id: &str,
        payload: Variables,
    ) -> EngineResult<ResumeOutcome> {
        let snapshot = self.registry.snapshot(workflow_id)?;
        if !snapshot.contains_node(node_id) {
            return Err(EngineError::UnknownNode {
                workflow_id: workflow_id.to_string(),
                node_id: node_id.to_string(),
            });
        }

        if let Some(record) = self.ledger.find_running(workflow_id).await? {
            let run_id = record.run_id;
            let guard = self.locks.acquire(run_id).await;
            let result = self.resume_existing(run_id, node_id, payload.clone()).await;
            drop(guard);
            self.locks.prune(run_id).await;

            match result {
                Ok(()) => {
                    tracing::info!("🔁 Resumed run {} at node {}", run_id, node_id);
                    return Ok(ResumeOutcome::Resumed { run_id });
                }
                Err(EngineError::StateNotFound(_)) => {
                    tracing::warn!(
                        "⚠️ Run {} is RUNNING without state; failing it and starting fresh",
                        run_id
                    );
                    self.fail_run(run_id, "Execution state expired before resume")
                        .await;
                }
                Err(e) => return Err(e),
            }
        }

        let run_id = self
            .start_run(snapshot, payload, Vec::new(), Some(node_id))
            .await?;
        tracing::info!("🔁 Started run {} at node {}", run_id, node_id);
        Ok(ResumeOutcome::Started { run_id })
    }

    async fn resume_existing(
        &self,
        run_id: Uuid,
        node_id: &str,
        payload: Variables,
    ) -> EngineResult<()> {
        let mut state = self.state.require(run_id).await?;
        let mut graph = self
            .state
            .load_graph(run_id)
            .await?
            .ok_or(EngineError::StateNotFound(run_id))?;
        let workflow = self.load_snapshot(run_id).await?;

        if !workflow.contains_node(node_id) {
            return Err(EngineError::UnknownNode {
                workflow_id: workflow.id.clone(),
                node_id: node_id.to_string(),
            });
        }

        if !payload.is_empty() {
            tracing::info!(
                "Merging {} payload variables into run {}",
                payload.len(),
                run_id
            );
            state.merge_globals(payload);
            state
                .global_variables
                .insert("webhook_resumed_at".into(), Value::String(Utc::now().to_rfc3339()));
            state
                .global_variables
                .insert("webhook_resume_node".into(), Value::String(node_id.to_string()));
        }

        graph.reopen(node_id);

        self.state.replace(&state).await?;
        self.state.save_graph(run_id, &graph).await?;
        let ready = vec![node_id.to_string()];
        self.state.register_ready(run_id, &ready).await?;
        self.dispatch_nodes(&workflow, &graph, &state, &ready).await
    }

    /// Start a run and block until it finishes or `timeout` elapses
    ///
    /// A timeout does not cancel the run; the answer carries whatever the
    /// run had accumulated so far.
    pub async fn run_and_wait(
        &self,
        workflow_id: &str,
        payload: Variables,
        return_variables: Vec<String>,
        timeout: Option<Duration>,
    ) -> EngineResult<ReturnPayload> {
        let timeout = timeout.unwrap_or(self.settings.default_wait_timeout);
        let run_id = self
            .start_workflow(workflow_id, payload, return_variables.clone())
            .await?;

        tracing::info!("⏳ Waiting up to {:?} for run {}", timeout, run_id);

        match wait_for_terminal(
            self.ledger.as_ref(),
            run_id,
            timeout,
            self.settings.wait_poll_interval,
        )
        .await?
        {
            WaitOutcome::Terminal(record) => Ok(payload_from_record(&record)),
            WaitOutcome::TimedOut => {
                let extracted = self.partial_result(run_id, &return_variables).await;
                Ok(ReturnPayload::new(
                    Some(run_id),
                    ReturnStatus::Timeout,
                    extracted,
                    Some(format!("Run did not finish within {}ms", timeout.as_millis())),
                ))
            }
            WaitOutcome::NotFound => Err(EngineError::RunNotFound(run_id)),
        }
    }

    /// Best-effort extraction from live state
    async fn partial_result(&self, run_id: Uuid, requested: &[String]) -> ExtractedVariables {
        match self.state.get(run_id).await {
            Ok(Some(state)) => returns::extract(&state, requested),
            Ok(None) => returns::extract_missing(requested),
            Err(e) => {
                tracing::warn!("⚠️ Could not read partial state of run {}: {}", run_id, e);
                returns::extract_missing(requested)
            }
        }
    }

    pub async fn run_record(&self, run_id: Uuid) -> EngineResult<RunRecord> {
        self.ledger
            .get(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }
}

/// Input context for `node_id`: every direct predecessor's output, flat and
/// under `<predecessor>_output`, overlaid by the run's global variables
pub fn build_input_context(
    graph: &DependencyGraph,
    state: &ExecutionState,
    node_id: &str,
) -> Variables {
    let mut context = Variables::new();

    for predecessor in graph.predecessors(node_id) {
        if let Some(output) = state.node_outputs.get(predecessor) {
            context.extend(output.iter().map(|(k, v)| (k.clone(), v.clone())));
            context.insert(
                format!("{}_output", predecessor),
                Value::Object(output.clone()),
            );
        }
    }

    context.extend(
        state
            .global_variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    context
}

fn failure_summary(state: &ExecutionState) -> String {
    let details: Vec<String> = state
        .node_errors
        .iter()
        .map(|(node, error)| format!("{}: {}", node, error))
        .collect();
    format!("Node(s) failed - {}", details.join("; "))
}

/// Synchronous answer built from a terminal record
pub fn payload_from_record(record: &RunRecord) -> ReturnPayload {
    let extracted = record
        .output
        .clone()
        .and_then(|v| serde_json::from_value::<ExtractedVariables>(v).ok())
        .unwrap_or_default();

    let status = match record.status {
        RunStatus::Completed => ReturnStatus::Completed,
        RunStatus::Failed => ReturnStatus::Failed,
        RunStatus::Running => ReturnStatus::Error,
    };

    ReturnPayload::new(Some(record.run_id), status, extracted, record.error.clone())
}
