//! Core data model shared by the orchestrator, the stores and the adapters.
//!
//! Chains (nodes + edges) are defined once and borrowed by every run. A
//! [`Run`] owns everything produced while executing a chain: node outputs,
//! provenance, telemetry and the final merged output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::merge::MergePolicy;
use crate::provenance::ProvenanceRecord;
use crate::schema::DataSchema;
use crate::tokens::UnresolvedToken;

pub type NodeId = String;
pub type RunId = String;

/// What a node does when it is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// Dispatches its input to an external agent through the agent-call adapter
    AgentCall,
    /// Produces its (transformed) input as output without any external call
    Transformer,
}

impl Default for NodeKind {
    fn default() -> Self {
        Self::AgentCall
    }
}

/// What happens to the run when a node cannot be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Halt the whole run; the failing node id is reported
    Abort,
    /// Store a null output for the node and keep going
    ContinuePartial,
    /// Record no output; consumers see an empty payload
    Skip,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Abort
    }
}

/// A unit of work in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Extra name usable in `@token` references besides the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<DataSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<DataSchema>,
    #[serde(default)]
    pub merge_policy: MergePolicy,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Overrides the default agent-call timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Node {
    pub fn agent(id: impl Into<String>, agent_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alias: None,
            kind: NodeKind::AgentCall,
            agent_ref: Some(agent_ref.into()),
            input_template: None,
            input_schema: None,
            output_schema: None,
            merge_policy: MergePolicy::default(),
            failure_policy: FailurePolicy::default(),
            timeout_ms: None,
        }
    }

    pub fn transformer(id: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Transformer,
            agent_ref: None,
            ..Self::agent(id, "")
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_template(mut self, template: Value) -> Self {
        self.input_template = Some(template);
        self
    }

    pub fn with_input_schema(mut self, schema: DataSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: DataSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Directed dependency: `to` consumes the output of `from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A chain definition: the graph plus chain-wide options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub id: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Policy combining terminal node outputs into the run output
    #[serde(default)]
    pub final_merge: MergePolicy,
    /// Generative synthesis is only tried when the chain opts in
    #[serde(default)]
    pub allow_synthesis: bool,
}

impl Chain {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            final_merge: MergePolicy::default(),
            allow_synthesis: false,
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn with_final_merge(mut self, policy: MergePolicy) -> Self {
        self.final_merge = policy;
        self
    }

    pub fn with_synthesis(mut self, allow: bool) -> Self {
        self.allow_synthesis = allow;
        self
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Which escalation tier produced the payload a node was called with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum TransformMethod {
    Direct,
    Deterministic,
    CachedRecipe { recipe_id: String },
    Suggested { recipe_id: String, confidence: f64 },
    Synthesized,
}

impl TransformMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Deterministic => "deterministic",
            Self::CachedRecipe { .. } => "cached-recipe",
            Self::Suggested { .. } => "suggested",
            Self::Synthesized => "synthesized",
        }
    }
}

/// One escalation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformAttempt {
    #[serde(flatten)]
    pub method: TransformMethod,
    pub input_fingerprint: String,
    pub output_fingerprint: String,
    pub compatibility_score: f64,
    pub cost_cents: i64,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Outcome of a node as recorded in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    /// Served from a stored execution log without calling the agent
    Replayed,
    /// Failed under `continue-partial`; output stored as null
    Partial,
    /// Failed under `skip`; no output stored
    Skipped,
    /// Failed under `abort`
    Failed,
}

/// Per-node execution record, appended in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTelemetry {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<TransformMethod>,
    pub attempts: Vec<TransformAttempt>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cost_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_tokens: Vec<UnresolvedToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
}

/// Request/response record of one agent call, kept for replay and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub idempotency_key: String,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub request: Value,
    #[serde(default)]
    pub response: Option<Value>,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub node_id: NodeId,
    /// Error class, e.g. `schema_incompatible`, `timeout`, `remote`
    pub kind: String,
    pub message: String,
}

/// One execution instance of a chain.
///
/// Timestamps are real `Option`s: an unfinished run serializes
/// `finished_at` as JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub chain_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reserved_cents: i64,
    pub spent_cents: i64,
    pub node_outputs: BTreeMap<NodeId, Value>,
    pub provenance: BTreeMap<String, ProvenanceRecord>,
    pub telemetry: Vec<NodeTelemetry>,
    pub output: Option<Value>,
    pub failure: Option<RunFailure>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            chain_id: chain_id.into(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            reserved_cents: 0,
            spent_cents: 0,
            node_outputs: BTreeMap::new(),
            provenance: BTreeMap::new(),
            telemetry: Vec::new(),
            output: None,
            failure: None,
        }
    }

    pub fn telemetry_for(&self, node_id: &str) -> Option<&NodeTelemetry> {
        self.telemetry.iter().rev().find(|t| t.node_id == node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unfinished_run_serializes_null_timestamps() {
        let run = Run::new("r1", "c1");
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["finished_at"], Value::Null);
        assert_eq!(value["started_at"], Value::Null);
        assert!(!value.to_string().contains("None"));
    }

    #[test]
    fn test_node_deserializes_with_defaults() {
        let node: Node = serde_json::from_value(json!({
            "id": "Sentiment",
            "agent_ref": "agents/sentiment",
            "failure_policy": "continue-partial"
        }))
        .unwrap();
        assert_eq!(node.kind, NodeKind::AgentCall);
        assert_eq!(node.merge_policy, MergePolicy::MergeByKey);
        assert_eq!(node.failure_policy, FailurePolicy::ContinuePartial);
    }

    #[test]
    fn test_transform_method_is_tagged() {
        let method = TransformMethod::Suggested {
            recipe_id: "abc".to_string(),
            confidence: 0.7,
        };
        let value = serde_json::to_value(&method).unwrap();
        assert_eq!(value["method"], "suggested");
        assert_eq!(value["recipe_id"], "abc");
        assert_eq!(method.label(), "suggested");
    }
}
