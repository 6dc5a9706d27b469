/// Execution State Store
///
/// Per-run ephemeral state kept in the key-value capability under a fixed key
/// layout, every key TTL-bound. The store only offers whole-value reads and
/// replaces; callers serialize read-modify-replace sequences per run through
/// `RunLocks`.

use crate::error::{EngineError, EngineResult};
use crate::runtime::{graph::DependencyGraph, kv::KeyValueStore};
use crate::workflow::types::{Variables, Workflow};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Key layout for one run
pub(crate) mod keys {
    use uuid::Uuid;

    pub fn context(run_id: Uuid) -> String {
        format!("execution:context:{}", run_id)
    }

    pub fn dependencies(run_id: Uuid) -> String {
        format!("execution:dependencies:{}", run_id)
    }

    pub fn ready(run_id: Uuid) -> String {
        format!("execution:ready:{}", run_id)
    }

    pub fn return_vars(run_id: Uuid) -> String {
        format!("execution:return_vars:{}", run_id)
    }

    pub fn definition(run_id: Uuid) -> String {
        format!("execution:definition:{}", run_id)
    }

    pub fn all(run_id: Uuid) -> Vec<String> {
        vec![
            context(run_id),
            dependencies(run_id),
            ready(run_id),
            return_vars(run_id),
            definition(run_id),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    /// Reserved; nothing transitions a run into it yet
    Paused,
}

/// Mutable per-run state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// Run-scoped variables; later writes overwrite
    pub global_variables: Variables,
    /// node id -> accumulated output
    pub node_outputs: HashMap<String, Variables>,
    /// Node ids in the order their completions were applied
    #[serde(default)]
    pub completion_order: Vec<String>,
    /// node id -> error reported by a failed completion
    #[serde(default)]
    pub node_errors: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Fresh RUNNING state seeded from the caller payload plus bookkeeping
    pub fn seeded(run_id: Uuid, workflow: &Workflow, payload: Variables) -> Self {
        let now = Utc::now();
        let mut globals = Variables::new();

        if !payload.is_empty() {
            tracing::debug!("Seeding {} payload variables for run {}", payload.len(), run_id);
            globals.extend(payload);
            globals.insert("payload_received".into(), Value::Bool(true));
            globals.insert("payload_timestamp".into(), Value::String(now.to_rfc3339()));
        }

        globals.insert("run_id".into(), Value::String(run_id.to_string()));
        globals.insert("workflow_id".into(), Value::String(workflow.id.clone()));
        globals.insert("workflow_name".into(), Value::String(workflow.name.clone()));
        globals.insert("run_started_at".into(), Value::String(now.to_rfc3339()));

        Self {
            run_id,
            workflow_id: workflow.id.clone(),
            status: ExecutionStatus::Running,
            global_variables: globals,
            node_outputs: HashMap::new(),
            completion_order: Vec::new(),
            node_errors: BTreeMap::new(),
            started_at: now,
        }
    }

    /// Merge an output into the node's entry; never touches global variables
    pub fn merge_node_output(&mut self, node_id: &str, output: Variables) {
        self.node_outputs
            .entry(node_id.to_string())
            .or_default()
            .extend(output);
    }

    /// Move the node to the end of the completion order
    ///
    /// A success supersedes an earlier failure of the same node.
    pub fn record_completion(&mut self, node_id: &str) {
        self.node_errors.remove(node_id);
        self.completion_order.retain(|id| id != node_id);
        self.completion_order.push(node_id.to_string());
    }

    pub fn record_failure(&mut self, node_id: &str, error: impl Into<String>) {
        self.node_errors.insert(node_id.to_string(), error.into());
    }

    pub fn merge_globals(&mut self, payload: Variables) {
        self.global_variables.extend(payload);
    }
}

/// Copy of a payload with the credential field masked, for logs and records
pub fn redact_credential(payload: &Variables, credential_field: &str) -> Variables {
    let mut redacted = payload.clone();
    if let Some(value) = redacted.get_mut(credential_field) {
        *value = Value::String("***".into());
    }
    redacted
}

#[derive(Clone)]
pub struct ExecutionStateStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl ExecutionStateStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn kv(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.kv)
    }

    pub async fn create(
        &self,
        run_id: Uuid,
        workflow: &Workflow,
        payload: Variables,
    ) -> Result<ExecutionState> {
        let state = ExecutionState::seeded(run_id, workflow, payload);
        self.replace(&state).await?;

        tracing::info!(
            "📦 Initialized execution state for run {} with {} variables",
            run_id,
            state.global_variables.len()
        );
        Ok(state)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Option<ExecutionState>> {
        match self.kv.get(&keys::context(run_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Like `get`, but a missing run is an error
    pub async fn require(&self, run_id: Uuid) -> EngineResult<ExecutionState> {
        self.get(run_id)
            .await?
            .ok_or(EngineError::StateNotFound(run_id))
    }

    /// Whole-state overwrite
    pub async fn replace(&self, state: &ExecutionState) -> Result<()> {
        self.kv
            .set(
                &keys::context(state.run_id),
                serde_json::to_value(state)?,
                self.ttl,
            )
            .await
    }

    /// Read, merge the output into `node_outputs[node_id]`, replace
    pub async fn record_node_output(
        &self,
        run_id: Uuid,
        node_id: &str,
        output: Variables,
    ) -> EngineResult<ExecutionState> {
        let mut state = self.require(run_id).await?;
        state.merge_node_output(node_id, output);
        self.replace(&state).await?;
        Ok(state)
    }

    pub async fn save_graph(&self, run_id: Uuid, graph: &DependencyGraph) -> Result<()> {
        self.kv
            .set(
                &keys::dependencies(run_id),
                serde_json::to_value(graph)?,
                self.ttl,
            )
            .await
    }

    pub async fn load_graph(&self, run_id: Uuid) -> Result<Option<DependencyGraph>> {
        match self.kv.get(&keys::dependencies(run_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Persist the definition snapshot the run executes against
    pub async fn save_definition(&self, run_id: Uuid, workflow: &Workflow) -> Result<()> {
        self.kv
            .set(
                &keys::definition(run_id),
                serde_json::to_value(workflow)?,
                self.ttl,
            )
            .await
    }

    pub async fn load_definition(&self, run_id: Uuid) -> Result<Option<Workflow>> {
        match self.kv.get(&keys::definition(run_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Append to the run's ready-node record
    pub async fn register_ready(&self, run_id: Uuid, node_ids: &[String]) -> Result<()> {
        if node_ids.is_empty() {
            return Ok(());
        }
        let values = node_ids.iter().cloned().map(Value::String).collect();
        self.kv.push(&keys::ready(run_id), values, self.ttl).await
    }

    pub async fn ready_nodes(&self, run_id: Uuid) -> Result<Vec<String>> {
        Ok(self
            .kv
            .range(&keys::ready(run_id))
            .await?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    /// Delete every per-run key, return-variable registration included
    pub async fn clear(&self, run_id: Uuid) -> Result<()> {
        let removed = self.kv.delete(&keys::all(run_id)).await?;
        tracing::debug!("🧹 Cleared {} state keys for run {}", removed, run_id);
        Ok(())
    }
}

/// Run-scoped mutual exclusion
///
/// Every coordinator path that reads and then replaces a run's graph or state
/// holds that run's guard for the whole sequence.
#[derive(Debug, Clone, Default)]
pub struct RunLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

pub type RunGuard = OwnedMutexGuard<()>;

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, run_id: Uuid) -> RunGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(run_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Forget the run's lock if nobody holds or waits on it
    pub async fn prune(&self, run_id: Uuid) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(&run_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&run_id);
        }
    }

    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::kv::MemoryKvStore;
    use crate::workflow::types::{Edge, Node};
    use serde_json::json;

    fn workflow() -> Workflow {
        Workflow {
            id: "wf-state".into(),
            name: "State".into(),
            owner_id: None,
            nodes: vec![Node::new("start", "start"), Node::new("end", "end")],
            edges: vec![Edge::new("start", "end")],
        }
    }

    fn store() -> (ExecutionStateStore, Arc<MemoryKvStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        (
            ExecutionStateStore::new(kv.clone(), Duration::from_secs(60)),
            kv,
        )
    }

    fn vars(value: Value) -> Variables {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn seeding_adds_bookkeeping() {
        let run_id = Uuid::new_v4();
        let state = ExecutionState::seeded(run_id, &workflow(), vars(json!({"user": "ada"})));

        let globals = &state.global_variables;
        assert_eq!(globals["user"], json!("ada"));
        assert_eq!(globals["payload_received"], json!(true));
        assert!(globals.contains_key("payload_timestamp"));
        assert_eq!(globals["run_id"], json!(run_id.to_string()));
        assert_eq!(globals["workflow_id"], json!("wf-state"));
        assert_eq!(globals["workflow_name"], json!("State"));
        assert!(globals.contains_key("run_started_at"));
        assert_eq!(state.status, ExecutionStatus::Running);
    }

    #[test]
    fn empty_payload_skips_payload_markers() {
        let state = ExecutionState::seeded(Uuid::new_v4(), &workflow(), Variables::new());
        assert!(!state.global_variables.contains_key("payload_received"));
        assert_eq!(state.global_variables.len(), 4);
    }

    #[test]
    fn completion_order_moves_repeats_to_the_end() {
        let mut state = ExecutionState::seeded(Uuid::new_v4(), &workflow(), Variables::new());
        state.record_completion("a");
        state.record_completion("b");
        state.record_completion("a");
        assert_eq!(state.completion_order, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn later_success_clears_node_error() {
        let mut state = ExecutionState::seeded(Uuid::new_v4(), &workflow(), Variables::new());
        state.record_failure("a", "boom");
        state.record_failure("b", "bust");
        state.record_completion("a");
        assert_eq!(state.node_errors.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn redaction_masks_only_the_credential() {
        let payload = vars(json!({"access_token": "secret", "q": 1}));
        let redacted = redact_credential(&payload, "access_token");
        assert_eq!(redacted["access_token"], json!("***"));
        assert_eq!(redacted["q"], json!(1));
        assert_eq!(payload["access_token"], json!("secret"));
    }

    #[tokio::test]
    async fn record_node_output_merges_without_touching_globals() {
        let (store, _) = store();
        let run_id = Uuid::new_v4();
        store.create(run_id, &workflow(), Variables::new()).await.unwrap();

        store
            .record_node_output(run_id, "start", vars(json!({"a": 1})))
            .await
            .unwrap();
        let state = store
            .record_node_output(run_id, "start", vars(json!({"b": 2})))
            .await
            .unwrap();

        assert_eq!(state.node_outputs["start"], vars(json!({"a": 1, "b": 2})));
        assert!(!state.global_variables.contains_key("a"));
        assert_eq!(store.get(run_id).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn missing_state_is_reported() {
        let (store, _) = store();
        let run_id = Uuid::new_v4();
        let err = store
            .record_node_output(run_id, "x", Variables::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateNotFound(id) if id == run_id));
    }

    #[tokio::test]
    async fn graph_definition_and_ready_list_persist() {
        let (store, _) = store();
        let run_id = Uuid::new_v4();
        let wf = workflow();
        let graph = DependencyGraph::build(&wf);

        store.save_graph(run_id, &graph).await.unwrap();
        store.save_definition(run_id, &wf).await.unwrap();
        store.register_ready(run_id, &["start".into()]).await.unwrap();
        store.register_ready(run_id, &["end".into()]).await.unwrap();

        assert_eq!(store.load_graph(run_id).await.unwrap(), Some(graph));
        assert_eq!(store.load_definition(run_id).await.unwrap().unwrap().id, "wf-state");
        assert_eq!(
            store.ready_nodes(run_id).await.unwrap(),
            vec!["start".to_string(), "end".to_string()]
        );
    }

    #[tokio::test]
    async fn clear_removes_every_run_key() {
        let (store, kv) = store();
        let run_id = Uuid::new_v4();
        let wf = workflow();
        store.create(run_id, &wf, Variables::new()).await.unwrap();
        store.save_graph(run_id, &DependencyGraph::build(&wf)).await.unwrap();
        store.save_definition(run_id, &wf).await.unwrap();
        store.register_ready(run_id, &["start".into()]).await.unwrap();
        kv.push(&keys::return_vars(run_id), vec![json!("x")], Duration::from_secs(60))
            .await
            .unwrap();

        store.clear(run_id).await.unwrap();

        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn state_expires_with_ttl() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = ExecutionStateStore::new(kv, Duration::from_millis(10));
        let run_id = Uuid::new_v4();
        store.create(run_id, &workflow(), Variables::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_locks_serialize_read_modify_replace() {
        let (store, _) = store();
        let locks = RunLocks::new();
        let run_id = Uuid::new_v4();
        store.create(run_id, &workflow(), Variables::new()).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let locks = locks.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(run_id).await;
                let mut state = store.get(run_id).await.unwrap().unwrap();
                tokio::task::yield_now().await;
                state.merge_node_output(&format!("n{}", i), Variables::new());
                store.replace(&state).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let state = store.get(run_id).await.unwrap().unwrap();
        assert_eq!(state.node_outputs.len(), 20);

        locks.prune(run_id).await;
        assert_eq!(locks.tracked().await, 0);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = RunLocks::new();
        let run_id = Uuid::new_v4();
        let guard = locks.acquire(run_id).await;

        locks.prune(run_id).await;
        assert_eq!(locks.tracked().await, 1);

        drop(guard);
        locks.prune(run_id).await;
        assert_eq!(locks.tracked().await, 0);
    }
}
