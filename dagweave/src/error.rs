use thiserror::Error;

use crate::config::ConfigError;
use crate::ledger::LedgerError;
use crate::oracles::AgentCallError;
use crate::storage::StoreError;
use crate::types::NodeId;

/// Errors that end a run, or prevent it from starting.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Graph contains a cycle through: {}", .nodes.join(", "))]
    GraphCycle { nodes: Vec<NodeId> },

    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    #[error("Insufficient funds on '{account_id}': requested {requested_cents}, available {available_cents}")]
    InsufficientFunds {
        account_id: String,
        requested_cents: i64,
        available_cents: i64,
    },

    #[error("Ledger error: {0}")]
    Ledger(LedgerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node '{node_id}' aborted the run ({kind}): {message}")]
    NodeAborted {
        node_id: NodeId,
        kind: String,
        message: String,
    },

    #[error("Run {run_id} was cancelled")]
    Cancelled { run_id: String },
}

impl OrchestratorError {
    /// Stable error class recorded in `RunFailure::kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GraphCycle { .. } => "graph_cycle",
            Self::InvalidChain(_) => "invalid_chain",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::Ledger(_) => "ledger",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::NodeAborted { .. } => "node_aborted",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

impl From<LedgerError> for OrchestratorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                account_id,
                requested_cents,
                available_cents,
            } => Self::InsufficientFunds {
                account_id,
                requested_cents,
                available_cents,
            },
            LedgerError::Store(e) => Self::Store(e),
            other => Self::Ledger(other),
        }
    }
}

/// Why a single node failed. Handled by the node's failure policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NodeError {
    #[error("No transform reached the acceptance threshold (best score {best_score:.3}): {}", .errors.join("; "))]
    SchemaIncompatible { best_score: f64, errors: Vec<String> },

    #[error("Agent call timed out after {0} ms")]
    Timeout(u64),

    #[error("Remote error: {0}")]
    Remote(String),
}

impl NodeError {
    /// Stable error class recorded in `RunFailure::kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SchemaIncompatible { .. } => "schema_incompatible",
            Self::Timeout(_) => "timeout",
            Self::Remote(_) => "remote",
        }
    }
}

impl From<AgentCallError> for NodeError {
    fn from(err: AgentCallError) -> Self {
        match err {
            AgentCallError::Timeout(d) => Self::Timeout(d.as_millis() as u64),
            AgentCallError::Remote(msg) => Self::Remote(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ledger_funds_error_is_lifted() {
        let err: OrchestratorError = LedgerError::InsufficientFunds {
            account_id: "a".into(),
            requested_cents: 5,
            available_cents: 1,
        }
        .into();
        assert!(matches!(err, OrchestratorError::InsufficientFunds { requested_cents: 5, .. }));
    }

    #[test]
    fn test_node_error_kinds() {
        let timeout: NodeError = AgentCallError::Timeout(Duration::from_millis(250)).into();
        assert_eq!(timeout, NodeError::Timeout(250));
        assert_eq!(timeout.kind(), "timeout");
        let cycle = OrchestratorError::GraphCycle {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(cycle.to_string(), "Graph contains a cycle through: a, b");
        assert_eq!(cycle.kind(), "graph_cycle");
        let store: OrchestratorError = StoreError::Invalid("disk full".into()).into();
        assert_eq!(store.kind(), "store");
    }
}
