// dagweave
// DAG transform orchestrator - schema-aware agent chaining

// Data model
pub mod error;
pub mod types;

// Transform building blocks
pub mod merge;
pub mod provenance;
pub mod recipes;
pub mod schema;
pub mod tokens;

// Side effects behind ports
pub mod ledger;
pub mod oracles;
pub mod storage;

// Infrastructure
pub mod config;
pub mod observability;

// Execution
pub mod orchestrator;

// Re-export the main orchestrator surface
pub use crate::config::OrchestratorConfig;
pub use crate::error::{NodeError, OrchestratorError};
pub use crate::merge::MergePolicy;
pub use crate::orchestrator::{CancelToken, DagOrchestrator, ExecuteOptions, RunResult};
pub use crate::types::{Chain, Edge, FailurePolicy, Node, NodeKind, Run, RunStatus};
