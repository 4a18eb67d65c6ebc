//! External collaborators
//!
//! The orchestrator only sees these traits. How an agent call is dispatched
//! (webhook, RPC, local function) and which model ranks or synthesizes
//! mappings is up to the adapter behind them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::recipes::MappingRecipe;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentCallError {
    #[error("Agent call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Remote agent error: {0}")]
    Remote(String),
}

/// Crash or transport failure inside an oracle. An oracle that simply has
/// no answer returns an empty list or [`SynthesisOutcome::ExplicitFailure`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed oracle response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait AgentCaller: Send + Sync {
    /// `timeout` is advisory for the adapter; the orchestrator enforces it
    /// independently.
    async fn call(
        &self,
        agent_ref: &str,
        payload: &Value,
        idempotency_key: &str,
        timeout: Duration,
    ) -> Result<Value, AgentCallError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub recipe: MappingRecipe,
    pub confidence: f64,
}

/// Ranks candidate recipes for a shape pair.
#[async_trait]
pub trait SuggestionOracle: Send + Sync {
    async fn suggest(
        &self,
        source_fingerprint: &str,
        target_fingerprint: &str,
        sample: &Value,
    ) -> Result<Vec<Suggestion>, OracleError>;
}

/// Generation settings sent with every synthesis request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSettings {
    pub temperature: f64,
    /// Fields that cannot be derived from the source must be emitted as null
    pub forbid_fabrication: bool,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            forbid_fabrication: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub source: Value,
    /// JSON form of the target schema
    pub target_schema: Value,
    /// Validation errors from the previous attempt, empty on the first one
    pub prior_errors: Vec<String>,
    /// 1-based attempt number
    pub attempt: u32,
    pub settings: SynthesisSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutcome {
    Payload(Value),
    /// The oracle declined; escalation ends without another attempt
    ExplicitFailure { reason: String },
}

/// Strict-JSON generative transform, used as the last escalation tier.
#[async_trait]
pub trait SynthesisOracle: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisOutcome, OracleError>;
}

/// Agent that answers with its input. Handy for dry runs of a chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoAgent;

#[async_trait]
impl AgentCaller for EchoAgent {
    async fn call(
        &self,
        agent_ref: &str,
        payload: &Value,
        _idempotency_key: &str,
        _timeout: Duration,
    ) -> Result<Value, AgentCallError> {
        log::debug!("[EchoAgent] {} <- {}", agent_ref, payload);
        Ok(payload.clone())
    }
}
