/// Workflow Management Layer
///
/// Definition types, SQLite persistence, and the hot-reload registry that
/// hands immutable snapshots to the coordinator.

// Core workflow type definitions
pub mod types;

// SQLite persistence layer for workflow storage
pub mod storage;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

pub use types::{DispatchCategory, Edge, Node, Variables, Workflow};
