#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dagweave::oracles::{
    AgentCallError, AgentCaller, OracleError, Suggestion, SuggestionOracle, SynthesisOracle,
    SynthesisOutcome, SynthesisRequest,
};
use dagweave::ledger::{
    AccountState, LedgerEntry, LedgerError, LedgerKind, LedgerOutcome, LedgerRequest,
    RunReservation,
};
use dagweave::observability::init_logging;
use dagweave::recipes::MappingRecipe;
use dagweave::storage::{AttemptRecord, InMemoryStore, PersistencePort, StoreError, StoreResult};
use dagweave::types::{ExecutionLog, Run};
use dagweave::{CancelToken, DagOrchestrator};

/// What a scripted agent does when called.
#[derive(Clone)]
pub enum Behavior {
    Respond(Value),
    Echo,
    Fail(String),
    /// Sleeps before answering; used to trigger timeouts
    Slow(Duration, Value),
    /// Cancels the token, then answers
    CancelRun(CancelToken, Value),
}

/// Agent adapter answering from a script keyed by agent ref. Unknown refs
/// echo their payload.
#[derive(Default)]
pub struct ScriptedAgent {
    script: HashMap<String, Behavior>,
    calls: Mutex<Vec<(String, Value)>>,
    count: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, agent_ref: &str, behavior: Behavior) -> Self {
        self.script.insert(agent_ref.to_string(), behavior);
        self
    }

    pub fn call_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, agent_ref: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == agent_ref)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl AgentCaller for ScriptedAgent {
    async fn call(
        &self,
        agent_ref: &str,
        payload: &Value,
        _idempotency_key: &str,
        _timeout: Duration,
    ) -> Result<Value, AgentCallError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((agent_ref.to_string(), payload.clone()));
        match self.script.get(agent_ref).cloned().unwrap_or(Behavior::Echo) {
            Behavior::Respond(value) => Ok(value),
            Behavior::Echo => Ok(payload.clone()),
            Behavior::Fail(message) => Err(AgentCallError::Remote(message)),
            Behavior::Slow(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Behavior::CancelRun(token, value) => {
                token.cancel();
                Ok(value)
            }
        }
    }
}

/// Suggestion oracle returning a fixed list.
pub struct ScriptedSuggestions {
    suggestions: Vec<Suggestion>,
    count: AtomicUsize,
}

impl ScriptedSuggestions {
    pub fn new(suggestions: Vec<Suggestion>) -> Self {
        Self {
            suggestions,
            count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SuggestionOracle for ScriptedSuggestions {
    async fn suggest(
        &self,
        _source_fingerprint: &str,
        _target_fingerprint: &str,
        _sample: &Value,
    ) -> Result<Vec<Suggestion>, OracleError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(self.suggestions.clone())
    }
}

/// Synthesis oracle answering from a queue; an exhausted queue is an
/// explicit failure.
pub struct ScriptedSynthesis {
    outcomes: Mutex<VecDeque<SynthesisOutcome>>,
    requests: Mutex<Vec<SynthesisRequest>>,
    /// When set, every call fails with this message
    unavailable: Option<String>,
}

impl ScriptedSynthesis {
    pub fn new(outcomes: Vec<SynthesisOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
            unavailable: None,
        }
    }

    pub fn unavailable(message: &str) -> Self {
        Self {
            unavailable: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynthesisOracle for ScriptedSynthesis {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisOutcome, OracleError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(message) = &self.unavailable {
            return Err(OracleError::Unavailable(message.clone()));
        }
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SynthesisOutcome::ExplicitFailure {
                reason: "script exhausted".to_string(),
            }))
    }
}

/// In-memory store whose execution log rejects every write.
pub struct BrokenLogStore {
    pub inner: Arc<InMemoryStore>,
}

#[async_trait]
impl PersistencePort for BrokenLogStore {
    async fn upsert_run(&self, run: &Run) -> StoreResult<()> {
        self.inner.upsert_run(run).await
    }
    async fn load_run(&self, run_id: &str) -> StoreResult<Option<Run>> {
        self.inner.load_run(run_id).await
    }
    async fn append_attempt(&self, record: &AttemptRecord) -> StoreResult<()> {
        self.inner.append_attempt(record).await
    }
    async fn attempts_for_run(&self, run_id: &str) -> StoreResult<Vec<AttemptRecord>> {
        self.inner.attempts_for_run(run_id).await
    }
    async fn append_execution_log(&self, _log: &ExecutionLog) -> StoreResult<()> {
        Err(StoreError::Invalid("execution log is read-only".to_string()))
    }
    async fn find_execution(&self, idempotency_key: &str) -> StoreResult<Option<ExecutionLog>> {
        self.inner.find_execution(idempotency_key).await
    }
    async fn recipes_for(&self, source: &str, target: &str) -> StoreResult<Vec<MappingRecipe>> {
        self.inner.recipes_for(source, target).await
    }
    async fn get_recipe(&self, recipe_id: &str) -> StoreResult<Option<MappingRecipe>> {
        self.inner.get_recipe(recipe_id).await
    }
    async fn record_recipe_outcome(
        &self,
        recipe: &MappingRecipe,
        success: bool,
    ) -> StoreResult<MappingRecipe> {
        self.inner.record_recipe_outcome(recipe, success).await
    }
    async fn ledger_account(&self, account_id: &str) -> StoreResult<Option<AccountState>> {
        self.inner.ledger_account(account_id).await
    }
    async fn ledger_entry(
        &self,
        idempotency_key: &str,
        kind: LedgerKind,
    ) -> StoreResult<Option<LedgerEntry>> {
        self.inner.ledger_entry(idempotency_key, kind).await
    }
    async fn run_reservation(&self, run_id: &str) -> StoreResult<Option<RunReservation>> {
        self.inner.run_reservation(run_id).await
    }
    async fn apply_ledger(&self, request: &LedgerRequest) -> Result<LedgerOutcome, LedgerError> {
        self.inner.apply_ledger(request).await
    }
}

pub fn memory_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}

pub fn orchestrator(store: Arc<InMemoryStore>, agent: Arc<ScriptedAgent>) -> DagOrchestrator {
    init_logging("dagweave=debug");
    let store: Arc<dyn PersistencePort> = store;
    DagOrchestrator::new(store, agent)
}
