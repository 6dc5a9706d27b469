/// Core workflow type definitions
///
/// Defines workflows, nodes, and edges as they arrive from the graph editor.
/// These types are serialized/deserialized from JSON for persistence and for
/// the immutable per-run snapshot the coordinator keeps.

use crate::error::{EngineError, EngineResult};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Flat key/value map used for node configuration, payloads, and outputs
pub type Variables = Map<String, Value>;

/// A complete workflow definition containing nodes and their connections
///
/// Workflows are stored as JSON in SQLite. Every run takes its own
/// snapshot, so later edits never reach in-flight executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-onboarding")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Owner recorded on every run of this workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Ordered list of nodes
    pub nodes: Vec<Node>,
    /// Edges encoding data/control dependencies
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A single typed step in the workflow graph
///
/// The coordinator never interprets `node_type` or `data`; it only routes the
/// node to the worker pool named by `category`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "NodeSpec")]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "start", "n1")
    pub id: String,
    /// Type tag matched against node handlers (e.g., "start", "httpGet")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Opaque node configuration
    pub data: Variables,
    /// Worker pool this node is dispatched to
    pub category: DispatchCategory,
}

/// Wire shape of a node; the category is optional and resolved on parse
#[derive(Deserialize)]
struct NodeSpec {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    data: Variables,
    #[serde(default)]
    category: Option<DispatchCategory>,
}

impl From<NodeSpec> for Node {
    fn from(spec: NodeSpec) -> Self {
        let category = spec
            .category
            .unwrap_or_else(|| DispatchCategory::for_node_type(&spec.node_type));
        Self {
            id: spec.id,
            node_type: spec.node_type,
            data: spec.data,
            category,
        }
    }
}

impl Node {
    /// Build a node, resolving its category from the type tag
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let node_type = node_type.into();
        Self {
            id: id.into(),
            category: DispatchCategory::for_node_type(&node_type),
            node_type,
            data: Variables::new(),
        }
    }
}

/// Node types served by the AI worker pool
const AI_NODE_TYPES: &[&str] = &[
    "text-generation",
    "ai-decision",
    "summarization",
    "question-answer",
    "text-classification",
    "named-entity",
    "translation",
    "content-generation",
    "search-agent",
    "data-analyst-agent",
];

/// Worker pool classification for a node
///
/// Resolved once when the definition is parsed and stored on the node, so
/// dispatch never re-derives routing from the type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchCategory {
    /// Integration and control nodes (start, transform, http, mail, ...)
    Core,
    /// Model-backed nodes (generation, classification, agents, ...)
    Ai,
}

impl DispatchCategory {
    pub const ALL: [DispatchCategory; 2] = [DispatchCategory::Core, DispatchCategory::Ai];

    pub fn for_node_type(node_type: &str) -> Self {
        let normalized = node_type.to_lowercase().replace('_', "-");
        if AI_NODE_TYPES.contains(&normalized.as_str()) {
            DispatchCategory::Ai
        } else {
            DispatchCategory::Core
        }
    }

    /// Queue name used in logs and metrics
    pub fn queue_name(&self) -> &'static str {
        match self {
            DispatchCategory::Core => "core-nodes",
            DispatchCategory::Ai => "ai-nodes",
        }
    }
}

/// Connection between two nodes in the workflow graph
///
/// `source` must complete before `target` becomes runnable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default = "default_source_handle")]
    pub source_handle: String,
    #[serde(default = "default_target_handle")]
    pub target_handle: String,
    #[serde(rename = "type", default = "default_edge_type")]
    pub edge_type: String,
    #[serde(default)]
    pub data: Variables,
}

fn default_source_handle() -> String {
    "output".to_string()
}

fn default_target_handle() -> String {
    "input".to_string()
}

fn default_edge_type() -> String {
    "default".to_string()
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            source_handle: default_source_handle(),
            target_handle: default_target_handle(),
            edge_type: default_edge_type(),
            data: Variables::new(),
        }
    }
}

impl Workflow {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.node(node_id).is_some()
    }

    /// Structural validation: non-empty, unique node ids, no dangling edges
    pub fn validate(&self) -> EngineResult<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::InvalidDefinition(format!(
                "Workflow '{}' has no nodes",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(EngineError::InvalidDefinition(format!(
                    "Duplicate node id '{}' in workflow '{}'",
                    node.id, self.id
                )));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(EngineError::InvalidDefinition(format!(
                        "Edge '{}' references unknown node: {}",
                        edge.id, endpoint
                    )));
                }
            }
        }

        Ok(())
    }

    /// Whether the edges form at least one cycle
    ///
    /// Assumes `validate` passed; edges with unknown endpoints are ignored.
    pub fn has_cycle(&self) -> bool {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut node_id_to_index: HashMap<&str, NodeIndex> = HashMap::new();

        for node in &self.nodes {
            node_id_to_index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }
        for edge in &self.edges {
            if let (Some(from), Some(to)) = (
                node_id_to_index.get(edge.source.as_str()),
                node_id_to_index.get(edge.target.as_str()),
            ) {
                graph.add_edge(*from, *to, ());
            }
        }

        petgraph::algo::is_cyclic_directed(&graph)
    }
}
