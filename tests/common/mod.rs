//! Shared fixtures for the integration suites
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use flowrelay::{
    api::AppState,
    config::Config,
    runtime::{dispatch::NodeExecutionRequest, worker::default_handlers, NodeHandler},
    server::build_state,
    workflow::{storage::connect_in_memory, Edge, Node, Variables, Workflow},
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

/// `calculator`: sums `a` and `b` from its input context
pub struct CalculatorHandler;

#[async_trait]
impl NodeHandler for CalculatorHandler {
    fn name(&self) -> &'static str {
        "calculator"
    }

    fn can_handle(&self, node_type: &str) -> bool {
        node_type == "calculator"
    }

    async fn execute(&self, request: &NodeExecutionRequest) -> Result<Variables> {
        let operand = |key: &str| {
            request
                .input_context
                .get(key)
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow!("operand '{}' missing", key))
        };
        let sum = operand("a")? + operand("b")?;
        Ok(vars(json!({ "sum": sum })))
    }
}

/// `explode`: always fails with "boom"
pub struct ExplodingHandler;

#[async_trait]
impl NodeHandler for ExplodingHandler {
    fn name(&self) -> &'static str {
        "explode"
    }

    fn can_handle(&self, node_type: &str) -> bool {
        node_type == "explode"
    }

    async fn execute(&self, _request: &NodeExecutionRequest) -> Result<Variables> {
        Err(anyhow!("boom"))
    }
}

/// `slow`: sleeps before reporting `slept: true`
pub struct SlowHandler(pub Duration);

#[async_trait]
impl NodeHandler for SlowHandler {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn can_handle(&self, node_type: &str) -> bool {
        node_type == "slow"
    }

    async fn execute(&self, _request: &NodeExecutionRequest) -> Result<Variables> {
        tokio::time::sleep(self.0).await;
        Ok(vars(json!({ "slept": true })))
    }
}

pub fn vars(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

pub fn workflow(id: &str, nodes: &[(&str, &str)], edges: &[(&str, &str)]) -> Workflow {
    Workflow {
        id: id.into(),
        name: format!("{} workflow", id),
        owner_id: Some("owner-1".into()),
        nodes: nodes.iter().map(|(id, ty)| Node::new(*id, *ty)).collect(),
        edges: edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect(),
    }
}

/// Fully wired application on an in-memory database
pub async fn app_state() -> AppState {
    let mut config = Config::default();
    config.execution.wait_poll_interval_ms = 10;
    config.execution.default_wait_timeout_ms = 5_000;
    config.execution.credential_field = "access_token".into();
    config.workers.core_parallelism = 3;
    config.workers.ai_parallelism = 1;
    config.workers.queue_capacity = 64;

    let mut handlers = default_handlers();
    handlers.push(Arc::new(CalculatorHandler));
    handlers.push(Arc::new(ExplodingHandler));
    handlers.push(Arc::new(SlowHandler(Duration::from_millis(400))));

    let pool = connect_in_memory().await.unwrap();
    build_state(&config, pool, handlers).await.unwrap()
}
