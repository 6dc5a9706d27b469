/// Dispatch Channel
///
/// Wire messages exchanged with node workers and the transport abstraction
/// that carries them. The in-process implementation partitions each dispatch
/// category into one bounded tokio channel per worker, picking the partition
/// from the (run, node) key the way a partitioned topic would.

use crate::workflow::types::{DispatchCategory, Variables};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DispatchPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// Coordinator -> worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRequest {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub node_id: String,
    pub node_type: String,
    pub node_data: Variables,
    /// Global variables plus flattened predecessor outputs
    pub input_context: Variables,
    pub predecessor_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: DispatchPriority,
    /// Bearer credential lifted out of the context for nodes that need it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// Worker -> coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCompletionEvent {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: CompletionStatus,
    #[serde(default)]
    pub output: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub processing_time_ms: u64,
}

impl NodeCompletionEvent {
    pub fn completed(request: &NodeExecutionRequest, output: Variables, processing_time_ms: u64) -> Self {
        Self {
            run_id: request.run_id,
            workflow_id: request.workflow_id.clone(),
            node_id: request.node_id.clone(),
            node_type: request.node_type.clone(),
            status: CompletionStatus::Completed,
            output,
            error: None,
            timestamp: Utc::now(),
            processing_time_ms,
        }
    }

    /// Failure event whose output carries the error, the failure time and the node type
    pub fn failed(request: &NodeExecutionRequest, error: impl Into<String>, processing_time_ms: u64) -> Self {
        let error = error.into();
        let now = Utc::now();

        let mut output = Variables::new();
        output.insert("error".into(), Value::String(error.clone()));
        output.insert("failed_at".into(), Value::String(now.to_rfc3339()));
        output.insert("node_type".into(), Value::String(request.node_type.clone()));

        Self {
            run_id: request.run_id,
            workflow_id: request.workflow_id.clone(),
            node_id: request.node_id.clone(),
            node_type: request.node_type.clone(),
            status: CompletionStatus::Failed,
            output,
            error: Some(error),
            timestamp: now,
            processing_time_ms,
        }
    }
}

/// Asynchronous transport between the coordinator and workers
#[async_trait]
pub trait DispatchChannel: Send + Sync {
    /// Hand one execution request to the worker pool of `category`
    async fn dispatch(&self, category: DispatchCategory, request: NodeExecutionRequest) -> Result<()>;

    /// Report a finished node back to the coordinator
    async fn publish_completion(&self, event: NodeCompletionEvent) -> Result<()>;
}

/// Receiving ends of an `InProcessDispatch`
#[derive(Debug)]
pub struct DispatchReceivers {
    /// One receiver per partition, per category
    pub requests: HashMap<DispatchCategory, Vec<mpsc::Receiver<NodeExecutionRequest>>>,
    pub completions: mpsc::Receiver<NodeCompletionEvent>,
}

#[derive(Debug, Clone)]
pub struct InProcessDispatch {
    partitions: HashMap<DispatchCategory, Vec<mpsc::Sender<NodeExecutionRequest>>>,
    completions: mpsc::Sender<NodeCompletionEvent>,
}

impl InProcessDispatch {
    /// Build the channel set; `parallelism` gives the partition count per category
    pub fn new(
        parallelism: &HashMap<DispatchCategory, usize>,
        capacity: usize,
    ) -> (Self, DispatchReceivers) {
        let capacity = capacity.max(1);
        let mut partitions = HashMap::new();
        let mut requests = HashMap::new();

        for category in DispatchCategory::ALL {
            let count = parallelism.get(&category).copied().unwrap_or(1).max(1);
            let (senders, receivers): (Vec<_>, Vec<_>) =
                (0..count).map(|_| mpsc::channel::<NodeExecutionRequest>(capacity)).unzip();
            partitions.insert(category, senders);
            requests.insert(category, receivers);
        }

        let (completion_tx, completion_rx) = mpsc::channel(capacity);

        (
            Self {
                partitions,
                completions: completion_tx,
            },
            DispatchReceivers {
                requests,
                completions: completion_rx,
            },
        )
    }

    pub fn partition_count(&self, category: DispatchCategory) -> usize {
        self.partitions.get(&category).map_or(0, Vec::len)
    }
}

/// Stable partition for a (run, node) key
pub fn partition_for(run_id: Uuid, node_id: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    run_id.hash(&mut hasher);
    node_id.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

#[async_trait]
impl DispatchChannel for InProcessDispatch {
    async fn dispatch(&self, category: DispatchCategory, request: NodeExecutionRequest) -> Result<()> {
        let senders = self
            .partitions
            .get(&category)
            .ok_or_else(|| anyhow!("No partitions for {}", category.queue_name()))?;
        let partition = partition_for(request.run_id, &request.node_id, senders.len());

        tracing::debug!(
            "📤 Dispatching node {} ({}) of run {} to {}[{}]",
            request.node_id,
            request.node_type,
            request.run_id,
            category.queue_name(),
            partition
        );

        senders[partition]
            .send(request)
            .await
            .map_err(|_| anyhow!("{} partition {} is closed", category.queue_name(), partition))
    }

    async fn publish_completion(&self, event: NodeCompletionEvent) -> Result<()> {
        self.completions
            .send(event)
            .await
            .map_err(|_| anyhow!("Completion channel is closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(node_id: &str) -> NodeExecutionRequest {
        NodeExecutionRequest {
            run_id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            node_id: node_id.into(),
            node_type: "transform".into(),
            node_data: Variables::new(),
            input_context: Variables::new(),
            predecessor_ids: vec![],
            timestamp: Utc::now(),
            priority: DispatchPriority::Normal,
            credential: None,
        }
    }

    fn parallelism(core: usize, ai: usize) -> HashMap<DispatchCategory, usize> {
        HashMap::from([(DispatchCategory::Core, core), (DispatchCategory::Ai, ai)])
    }

    #[test]
    fn partitioning_is_stable_and_in_range() {
        let run_id = Uuid::new_v4();
        let first = partition_for(run_id, "n1", 3);
        for _ in 0..10 {
            assert_eq!(partition_for(run_id, "n1", 3), first);
        }
        assert!(first < 3);
        assert_eq!(partition_for(run_id, "n1", 1), 0);
        assert_eq!(partition_for(run_id, "n1", 0), 0);
    }

    #[test]
    fn request_wire_format_is_camel_case() {
        let json = serde_json::to_value(request("n1")).unwrap();
        assert_eq!(json["nodeId"], json!("n1"));
        assert_eq!(json["priority"], json!("NORMAL"));
        assert!(json.get("credential").is_none());
        assert!(json.get("inputContext").is_some());
    }

    #[test]
    fn failed_event_carries_error_details_in_output() {
        let event = NodeCompletionEvent::failed(&request("n1"), "boom", 12);
        assert_eq!(event.status, CompletionStatus::Failed);
        assert_eq!(event.error.as_deref(), Some("boom"));
        assert_eq!(event.output["error"], json!("boom"));
        assert_eq!(event.output["node_type"], json!("transform"));
        assert!(event.output.contains_key("failed_at"));
        assert_eq!(event.processing_time_ms, 12);
    }

    #[tokio::test]
    async fn requests_land_on_their_category_partition() {
        let (dispatch, mut receivers) = InProcessDispatch::new(&parallelism(3, 1), 8);
        assert_eq!(dispatch.partition_count(DispatchCategory::Core), 3);
        assert_eq!(dispatch.partition_count(DispatchCategory::Ai), 1);

        let req = request("n1");
        let expected = partition_for(req.run_id, "n1", 3);
        dispatch.dispatch(DispatchCategory::Core, req.clone()).await.unwrap();

        let core = receivers.requests.get_mut(&DispatchCategory::Core).unwrap();
        assert_eq!(core[expected].recv().await.unwrap(), req);

        let ai_req = request("sum");
        dispatch.dispatch(DispatchCategory::Ai, ai_req.clone()).await.unwrap();
        let ai = receivers.requests.get_mut(&DispatchCategory::Ai).unwrap();
        assert_eq!(ai[0].recv().await.unwrap(), ai_req);
    }

    #[tokio::test]
    async fn completions_flow_back_and_closed_channels_error() {
        let (dispatch, mut receivers) = InProcessDispatch::new(&parallelism(1, 1), 4);
        let req = request("n1");

        dispatch
            .publish_completion(NodeCompletionEvent::completed(&req, Variables::new(), 1))
            .await
            .unwrap();
        let event = receivers.completions.recv().await.unwrap();
        assert_eq!(event.node_id, "n1");
        assert_eq!(event.status, CompletionStatus::Completed);

        drop(receivers);
        assert!(dispatch.dispatch(DispatchCategory::Core, req).await.is_err());
    }
}
