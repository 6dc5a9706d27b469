/// Node workers
///
/// Workers consume execution requests from the dispatch partitions, resolve a
/// handler for the node type and publish a completion event. The handler list
/// is injected once at startup and searched in order; the first handler that
/// accepts a node type runs it.

use crate::runtime::dispatch::{DispatchChannel, NodeCompletionEvent, NodeExecutionRequest};
use crate::workflow::types::{DispatchCategory, Variables};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::mpsc, task::JoinHandle};

/// Capability to execute one family of node types
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    fn can_handle(&self, node_type: &str) -> bool;

    /// Produce the node's output map, or fail
    async fn execute(&self, request: &NodeExecutionRequest) -> Result<Variables>;
}

/// Entry node: echoes its input context and any configured seed context
///
/// `node_data.context` may be a map or a JSON-encoded string of one; it is
/// applied before the input context so run variables win on conflicts.
#[derive(Debug, Default)]
pub struct StartNodeHandler;

#[async_trait]
impl NodeHandler for StartNodeHandler {
    fn name(&self) -> &'static str {
        "start"
    }

    fn can_handle(&self, node_type: &str) -> bool {
        node_type == "start"
    }

    async fn execute(&self, request: &NodeExecutionRequest) -> Result<Variables> {
        let mut output = Variables::new();

        match request.node_data.get("context") {
            Some(Value::Object(map)) => {
                tracing::debug!("Loaded start context map with {} keys", map.len());
                output.extend(map.clone());
            }
            Some(Value::String(raw)) if !raw.trim().is_empty() => {
                match serde_json::from_str::<Variables>(raw) {
                    Ok(parsed) => {
                        tracing::debug!("Parsed start context string with {} keys", parsed.len());
                        output.extend(parsed);
                    }
                    Err(e) => tracing::warn!(
                        "⚠️ Ignoring unparseable start context on node {}: {}",
                        request.node_id,
                        e
                    ),
                }
            }
            Some(Value::Null) | Some(Value::String(_)) | None => {}
            Some(other) => tracing::warn!(
                "⚠️ Unexpected start context type on node {}: {}",
                request.node_id,
                other
            ),
        }

        output.extend(request.input_context.clone());
        output.insert("node_executed_at".into(), Value::String(Utc::now().to_rfc3339()));
        output.insert("node_type".into(), Value::String("start".into()));
        output.insert("run_id".into(), Value::String(request.run_id.to_string()));
        output.insert("started_by".into(), Value::String("workflow_coordinator".into()));

        Ok(output)
    }
}

/// Terminal and no-op nodes: outputs nothing of their own
#[derive(Debug, Default)]
pub struct PassthroughHandler;

#[async_trait]
impl NodeHandler for PassthroughHandler {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn can_handle(&self, node_type: &str) -> bool {
        matches!(node_type, "end" | "noop")
    }

    async fn execute(&self, request: &NodeExecutionRequest) -> Result<Variables> {
        let mut output = Variables::new();
        output.insert("node_type".into(), Value::String(request.node_type.clone()));
        output.insert("node_executed_at".into(), Value::String(Utc::now().to_rfc3339()));
        Ok(output)
    }
}

/// Built-in handlers, in resolution order
pub fn default_handlers() -> Vec<Arc<dyn NodeHandler>> {
    vec![Arc::new(StartNodeHandler), Arc::new(PassthroughHandler)]
}

/// Ordered handler list shared by every worker
#[derive(Clone)]
pub struct WorkerPool {
    handlers: Arc<Vec<Arc<dyn NodeHandler>>>,
    channel: Arc<dyn DispatchChannel>,
}

impl WorkerPool {
    pub fn new(handlers: Vec<Arc<dyn NodeHandler>>, channel: Arc<dyn DispatchChannel>) -> Self {
        tracing::info!(
            "🧰 Worker pool handlers: {:?}",
            handlers.iter().map(|h| h.name()).collect::<Vec<_>>()
        );
        Self {
            handlers: Arc::new(handlers),
            channel,
        }
    }

    fn find_handler(&self, node_type: &str) -> Option<&Arc<dyn NodeHandler>> {
        self.handlers.iter().find(|h| h.can_handle(node_type))
    }

    /// Execute one request and turn the result into a completion event
    pub async fn run_node(&self, request: &NodeExecutionRequest) -> NodeCompletionEvent {
        let started = Instant::now();

        let Some(handler) = self.find_handler(&request.node_type) else {
            let error = format!("No handler found for node type: {}", request.node_type);
            tracing::error!("❌ {}", error);
            return NodeCompletionEvent::failed(request, error, elapsed_ms(started));
        };

        match handler.execute(request).await {
            Ok(output) => {
                let elapsed = elapsed_ms(started);
                tracing::info!(
                    "✅ Node {} ({}) of run {} completed in {}ms",
                    request.node_id,
                    request.node_type,
                    request.run_id,
                    elapsed
                );
                NodeCompletionEvent::completed(request, output, elapsed)
            }
            Err(e) => {
                let elapsed = elapsed_ms(started);
                tracing::error!(
                    "❌ Node {} ({}) of run {} failed after {}ms: {}",
                    request.node_id,
                    request.node_type,
                    request.run_id,
                    elapsed,
                    e
                );
                NodeCompletionEvent::failed(request, e.to_string(), elapsed)
            }
        }
    }

    /// Spawn one worker task per partition receiver
    pub fn spawn(
        &self,
        partitions: HashMap<DispatchCategory, Vec<mpsc::Receiver<NodeExecutionRequest>>>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for (category, receivers) in partitions {
            for (partition, mut receiver) in receivers.into_iter().enumerate() {
                let pool = self.clone();
                handles.push(tokio::spawn(async move {
                    tracing::debug!("👷 Worker {}[{}] started", category.queue_name(), partition);

                    while let Some(request) = receiver.recv().await {
                        let event = pool.run_node(&request).await;
                        if let Err(e) = pool.channel.publish_completion(event).await {
                            tracing::error!(
                                "❌ Failed to publish completion for node {}: {}",
                                request.node_id,
                                e
                            );
                        }
                    }

                    tracing::debug!("Worker {}[{}] stopped", category.queue_name(), partition);
                }));
            }
        }

        handles
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::dispatch::{CompletionStatus, DispatchPriority, InProcessDispatch};
    use anyhow::bail;
    use serde_json::json;
    use uuid::Uuid;

    fn request(node_type: &str, node_data: Value, input: Value) -> NodeExecutionRequest {
        NodeExecutionRequest {
            run_id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            node_id: "n1".into(),
            node_type: node_type.into(),
            node_data: serde_json::from_value(node_data).unwrap(),
            input_context: serde_json::from_value(input).unwrap(),
            predecessor_ids: vec![],
            timestamp: Utc::now(),
            priority: DispatchPriority::Normal,
            credential: None,
        }
    }

    struct Exploding;

    #[async_trait]
    impl NodeHandler for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn can_handle(&self, node_type: &str) -> bool {
            node_type == "explode"
        }

        async fn execute(&self, _request: &NodeExecutionRequest) -> Result<Variables> {
            bail!("kaboom")
        }
    }

    fn pool(handlers: Vec<Arc<dyn NodeHandler>>) -> (WorkerPool, crate::runtime::dispatch::DispatchReceivers) {
        let parallelism = HashMap::from([(DispatchCategory::Core, 1), (DispatchCategory::Ai, 1)]);
        let (dispatch, receivers) = InProcessDispatch::new(&parallelism, 8);
        (WorkerPool::new(handlers, Arc::new(dispatch)), receivers)
    }

    #[tokio::test]
    async fn start_merges_configured_and_input_context() {
        let req = request(
            "start",
            json!({"context": {"greeting": "hi", "user": "default"}}),
            json!({"user": "ada"}),
        );
        let output = StartNodeHandler.execute(&req).await.unwrap();

        assert_eq!(output["greeting"], json!("hi"));
        assert_eq!(output["user"], json!("ada"));
        assert_eq!(output["node_type"], json!("start"));
        assert_eq!(output["started_by"], json!("workflow_coordinator"));
        assert!(output.contains_key("node_executed_at"));
    }

    #[tokio::test]
    async fn start_accepts_json_string_context() {
        let req = request("start", json!({"context": "{\"limit\": 10}"}), json!({}));
        let output = StartNodeHandler.execute(&req).await.unwrap();
        assert_eq!(output["limit"], json!(10));

        let bad = request("start", json!({"context": "{not json"}), json!({}));
        assert!(StartNodeHandler.execute(&bad).await.is_ok());
    }

    #[tokio::test]
    async fn first_matching_handler_wins() {
        let (pool, _rx) = pool(default_handlers());
        let event = pool.run_node(&request("end", json!({}), json!({}))).await;
        assert_eq!(event.status, CompletionStatus::Completed);
        assert_eq!(event.output["node_type"], json!("end"));
    }

    #[tokio::test]
    async fn unknown_type_fails_explicitly() {
        let (pool, _rx) = pool(default_handlers());
        let event = pool.run_node(&request("sendEmail", json!({}), json!({}))).await;

        assert_eq!(event.status, CompletionStatus::Failed);
        assert_eq!(
            event.error.as_deref(),
            Some("No handler found for node type: sendEmail")
        );
    }

    #[tokio::test]
    async fn handler_errors_become_failed_events() {
        let (pool, _rx) = pool(vec![Arc::new(Exploding)]);
        let event = pool.run_node(&request("explode", json!({}), json!({}))).await;

        assert_eq!(event.status, CompletionStatus::Failed);
        assert_eq!(event.output["error"], json!("kaboom"));
        assert_eq!(event.output["node_type"], json!("explode"));
    }

    #[tokio::test]
    async fn spawned_workers_publish_completions() {
        let parallelism = HashMap::from([(DispatchCategory::Core, 2), (DispatchCategory::Ai, 1)]);
        let (dispatch, mut receivers) = InProcessDispatch::new(&parallelism, 8);
        let dispatch = Arc::new(dispatch);
        let pool = WorkerPool::new(default_handlers(), dispatch.clone());
        let handles = pool.spawn(std::mem::take(&mut receivers.requests));
        assert_eq!(handles.len(), 3);

        let req = request("noop", json!({}), json!({}));
        dispatch
            .dispatch(DispatchCategory::Core, req.clone())
            .await
            .unwrap();

        let event = receivers.completions.recv().await.unwrap();
        assert_eq!(event.run_id, req.run_id);
        assert_eq!(event.status, CompletionStatus::Completed);

        for handle in handles {
            handle.abort();
        }
    }
}
