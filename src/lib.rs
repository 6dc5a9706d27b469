/// flowrelay: distributed workflow execution coordinator
///
/// Runs DAG workflows by incremental Kahn resolution: ready nodes are handed
/// to asynchronous workers and every completion event releases the next set.
/// Definitions hot-reload through an ArcSwap registry; run outcomes land in a
/// durable ledger that synchronous callers wait on.

// Core configuration and setup
pub mod config;

// Crate-wide error taxonomy
pub mod error;

// Workflow management layer - handles workflow definitions, storage, and registry
pub mod workflow;

// Execution coordination - dependency graph, state, dispatch and completion loop
pub mod runtime;

// HTTP API layer - REST endpoints for workflows, runs and triggers
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use runtime::{Coordinator, NodeHandler, RunStatus};
pub use server::start_server;
pub use workflow::{DispatchCategory, Edge, Node, Workflow};
