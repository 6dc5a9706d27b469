/// Execution coordination subsystem
///
/// This module drives workflow runs across asynchronous workers:
/// - Incremental Kahn dependency resolution per run
/// - TTL-bound execution state with per-run locking
/// - Dispatch of ready nodes and consumption of completion events
/// - Durable run records and return-variable extraction

// Kahn-style dependency graph
pub mod graph;

// TTL key-value capability and in-memory store
pub mod kv;

// Per-run execution state and run locks
pub mod state;

// Return variable registration and extraction
pub mod returns;

// Durable run records and the synchronous wait
pub mod ledger;

// Wire messages and the dispatch channel
pub mod dispatch;

// Node handlers and the worker pool
pub mod worker;

// Run control loop
pub mod coordinator;

// Completion event consumer
pub mod consumer;

// Re-export main types
pub use coordinator::{CompletionOutcome, Coordinator, CoordinatorSettings, ResumeOutcome};
pub use dispatch::{DispatchChannel, InProcessDispatch, NodeCompletionEvent, NodeExecutionRequest};
pub use graph::DependencyGraph;
pub use kv::{KeyValueStore, MemoryKvStore};
pub use ledger::{RunLedger, RunRecord, RunStatus, SqliteRunLedger};
pub use state::{ExecutionState, ExecutionStateStore, ExecutionStatus};
pub use worker::{NodeHandler, WorkerPool};
