//! DAG Orchestrator
//!
//! Drives one execution of a [`Chain`]:
//!
//! ```text
//!   validate ─► hold node prices ─► ┌──────────── per batch ────────────┐ ─► final merge
//!                                   │ merge parents ─► resolve @tokens  │    provenance
//!                                   │ ─► escalate ─► agent call         │    refund_all
//!                                   │ ─► settle / refund ─► telemetry   │
//!                                   └───────────────────────────────────┘
//! ```
//!
//! Ready nodes run concurrently in batches of at most `max_workers`; the
//! orchestrator waits for the whole batch and applies its results in node
//! definition order, so the run is identical whatever the batch size.
//! Agent calls are keyed by `sha256(run, node, canonical input)`: a stored
//! successful execution under the same key is replayed instead of calling
//! the agent again.

mod escalation;
pub mod graph;

pub use escalation::{Accepted, EscalationOutcome, Escalator};
pub use graph::{ChainGraph, ReadyQueue, RESERVED_ALIASES};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{ConfigError, OrchestratorConfig};
use crate::error::{NodeError, OrchestratorError};
use crate::ledger::{self, LedgerService};
use crate::oracles::{AgentCaller, SuggestionOracle, SynthesisOracle};
use crate::provenance::{Contribution, ProvenanceTracker};
use crate::recipes::MappingCache;
use crate::schema::{shape_fingerprint, SchemaMatcher};
use crate::storage::{AttemptRecord, PersistencePort};
use crate::tokens::{self, UnresolvedToken};
use crate::types::{
    Chain, ExecutionLog, ExecutionStatus, FailurePolicy, Node, NodeId, NodeKind, NodeStatus,
    NodeTelemetry, Run, RunFailure, RunStatus, TransformAttempt, TransformMethod,
};

/// Cooperative run cancellation. Checked before and after every batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Reusing a run id replays stored agent calls and ledger operations
    pub run_id: Option<String>,
    /// Account charged for agent calls; no ledger activity when unset
    pub account_id: Option<String>,
    /// Price in cents per agent-call node; missing nodes are free
    pub pricing: BTreeMap<NodeId, i64>,
    pub cancel: Option<CancelToken>,
    /// Overrides `OrchestratorConfig::max_workers`
    pub max_workers: Option<usize>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_price(mut self, node_id: impl Into<String>, cents: i64) -> Self {
        self.pricing.insert(node_id.into(), cents);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    fn price_of(&self, node_id: &str) -> i64 {
        self.pricing.get(node_id).copied().unwrap_or(0)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(CancelToken::is_cancelled).unwrap_or(false)
    }
}

/// Outcome of [`DagOrchestrator::execute`] for runs that got past
/// validation and funding. A run halted by an `abort` node is still a
/// `RunResult` so partial outputs and telemetry are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run: Run,
}

impl RunResult {
    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    pub fn output(&self) -> Option<&Value> {
        self.run.output.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.run.status == RunStatus::Succeeded
    }

    /// Turns failed and cancelled runs into errors.
    pub fn into_result(self) -> Result<Run, OrchestratorError> {
        match self.run.status {
            RunStatus::Failed => {
                let failure = self.run.failure.unwrap_or(RunFailure {
                    node_id: String::new(),
                    kind: "unknown".to_string(),
                    message: "run failed".to_string(),
                });
                Err(OrchestratorError::NodeAborted {
                    node_id: failure.node_id,
                    kind: failure.kind,
                    message: failure.message,
                })
            }
            RunStatus::Cancelled => Err(OrchestratorError::Cancelled {
                run_id: self.run.run_id,
            }),
            _ => Ok(self.run),
        }
    }
}

/// Hands out strictly increasing timestamps for one run, even when the wall
/// clock returns the same reading twice.
#[derive(Debug)]
struct RunClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl RunClock {
    fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    fn tick(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let next = match *last {
            Some(prev) if now <= prev => prev + ChronoDuration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

/// Sorted-key JSON, so equal payloads hash equally.
fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                let mut out = Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), v);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// Idempotency key of an agent call.
pub fn execution_key(run_id: &str, node_id: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(node_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Shared, read-only state of a run for the nodes of one batch.
struct NodeContext<'a> {
    run_id: &'a str,
    account_id: Option<&'a str>,
    clock: &'a RunClock,
    allow_synthesis: bool,
}

/// A node ready to run, with its input already built.
struct NodeJob<'a> {
    index: usize,
    node: &'a Node,
    input: Value,
    unresolved: Vec<UnresolvedToken>,
    price: i64,
}

struct NodeReport {
    index: usize,
    telemetry: NodeTelemetry,
    outcome: Result<Value, NodeError>,
    accepted: Option<(TransformMethod, f64)>,
    /// Oracle charges; the node price is added when the report is applied
    spent_cents: i64,
    price: i64,
}

pub struct DagOrchestrator {
    store: Arc<dyn PersistencePort>,
    agent: Arc<dyn AgentCaller>,
    suggestion: Option<Arc<dyn SuggestionOracle>>,
    synthesis: Option<Arc<dyn SynthesisOracle>>,
    config: OrchestratorConfig,
    matcher: SchemaMatcher,
    cache: MappingCache,
    ledger: LedgerService,
}

impl DagOrchestrator {
    pub fn new(store: Arc<dyn PersistencePort>, agent: Arc<dyn AgentCaller>) -> Self {
        let config = OrchestratorConfig::default();
        Self {
            matcher: config.matcher(),
            cache: MappingCache::new(store.clone()),
            ledger: LedgerService::new(store.clone()),
            store,
            agent,
            suggestion: None,
            synthesis: None,
            config,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        self.matcher = config.matcher();
        self.config = config;
        Ok(self)
    }

    pub fn with_suggestion_oracle(mut self, oracle: Arc<dyn SuggestionOracle>) -> Self {
        self.suggestion = Some(oracle);
        self
    }

    pub fn with_synthesis_oracle(mut self, oracle: Arc<dyn SynthesisOracle>) -> Self {
        self.synthesis = Some(oracle);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn matcher(&self) -> &SchemaMatcher {
        &self.matcher
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    pub fn cache(&self) -> &MappingCache {
        &self.cache
    }

    pub fn store(&self) -> Arc<dyn PersistencePort> {
        self.store.clone()
    }

    /// Executes `chain` on `root_input`.
    ///
    /// Invalid graphs and unfundable runs are rejected with an error before
    /// any node runs. Everything after that, including an aborted or
    /// cancelled run, comes back as a [`RunResult`], unless the store or the
    /// ledger fails mid-run: the run is then released, recorded as failed
    /// and the error returned.
    pub async fn execute(
        &self,
        chain: &Chain,
        root_input: Value,
        options: ExecuteOptions,
    ) -> Result<RunResult, OrchestratorError> {
        let graph = ChainGraph::build(chain)?;
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let clock = RunClock::new();

        let mut run = Run::new(run_id.clone(), chain.id.clone());
        run.status = RunStatus::Running;
        run.started_at = Some(clock.tick());
        self.store.upsert_run(&run).await?;
        log::info!(
            "[Orchestrator] run {} started: chain={} nodes={} edges={}",
            run_id,
            chain.id,
            chain.nodes.len(),
            chain.edges.len()
        );

        if let Some(account_id) = options.account_id.as_deref() {
            if let Err((node_id, err)) = self.hold_prices(chain, &options, account_id, &mut run).await {
                log::warn!("[Orchestrator] run {} not funded: {}", run_id, err);
                return Err(self.abandon(&mut run, &clock, &options, Some(node_id), err).await);
            }
        }

        let ctx = NodeContext {
            run_id: &run_id,
            account_id: options.account_id.as_deref(),
            clock: &clock,
            allow_synthesis: chain.allow_synthesis,
        };
        let (cancelled, accepted) = match self
            .run_batches(chain, &graph, &ctx, &root_input, &options, &mut run)
            .await
        {
            Ok(done) => done,
            Err((node_id, err)) => {
                return Err(self.abandon(&mut run, &clock, &options, node_id, err).await)
            }
        };

        run.status = if cancelled {
            RunStatus::Cancelled
        } else if run.failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        if run.status == RunStatus::Succeeded {
            let (output, provenance) = self.finalize_output(chain, &graph, &run, &accepted);
            run.output = Some(output);
            run.provenance = provenance;
        }

        if options.account_id.is_some() {
            if let Err(err) = self.ledger.refund_all(&run_id).await {
                return Err(self.abandon(&mut run, &clock, &options, None, err.into()).await);
            }
        }
        run.finished_at = Some(clock.tick());
        self.store.upsert_run(&run).await?;
        log::info!(
            "[Orchestrator] run {} {}: {} node(s) recorded, spent {}c",
            run_id,
            run.status.as_str(),
            run.telemetry.len(),
            run.spent_cents
        );
        Ok(RunResult { run })
    }

    /// Runs ready batches until the queue drains, a node aborts or the run
    /// is cancelled. Returns whether the run was cancelled, and the accepted
    /// transform of every node that produced an output.
    ///
    /// An error names the node being applied when it happened, if any.
    async fn run_batches(
        &self,
        chain: &Chain,
        graph: &ChainGraph,
        ctx: &NodeContext<'_>,
        root_input: &Value,
        options: &ExecuteOptions,
        run: &mut Run,
    ) -> Result<(bool, HashMap<usize, (TransformMethod, f64)>), (Option<NodeId>, OrchestratorError)>
    {
        let max_workers = options.max_workers.unwrap_or(self.config.max_workers).max(1);
        let mut queue = graph.ready_queue();
        let mut accepted: HashMap<usize, (TransformMethod, f64)> = HashMap::new();

        loop {
            if options.is_cancelled() {
                return Ok((true, accepted));
            }
            let batch = queue.next_batch(max_workers);
            if batch.is_empty() {
                return Ok((false, accepted));
            }
            log::debug!(
                "[Orchestrator] run {} batch: {:?}",
                ctx.run_id,
                batch.iter().map(|&i| chain.nodes[i].id.as_str()).collect::<Vec<_>>()
            );

            let current: &Run = run;
            let jobs: Vec<NodeJob<'_>> = batch
                .iter()
                .map(|&i| self.prepare(chain, graph, i, current, root_input, options))
                .collect();
            let reports = join_all(jobs.into_iter().map(|job| self.run_node(ctx, job))).await;

            // Nothing from this batch is settled; refund_all releases its holds
            if options.is_cancelled() {
                log::info!(
                    "[Orchestrator] run {} cancelled; discarding results of {} in-flight node(s)",
                    ctx.run_id,
                    reports.len()
                );
                return Ok((true, accepted));
            }

            for (&index, report) in batch.iter().zip(reports) {
                let node = &chain.nodes[index];
                let report = report.map_err(|e| (Some(node.id.clone()), e))?;
                let settled = self
                    .settle_node(ctx.account_id, ctx.run_id, &report, node)
                    .await
                    .map_err(|e| (Some(node.id.clone()), e))?;

                let mut telemetry = report.telemetry;
                telemetry.cost_cents += settled;
                run.telemetry.push(telemetry);
                run.spent_cents += report.spent_cents + settled;
                match report.outcome {
                    Ok(output) => {
                        run.node_outputs.insert(node.id.clone(), output);
                        if let Some(method) = report.accepted {
                            accepted.insert(index, method);
                        }
                    }
                    Err(err) => match node.failure_policy {
                        FailurePolicy::Abort => {
                            if run.failure.is_none() {
                                run.failure = Some(RunFailure {
                                    node_id: node.id.clone(),
                                    kind: err.kind().to_string(),
                                    message: err.to_string(),
                                });
                            }
                        }
                        FailurePolicy::ContinuePartial => {
                            run.node_outputs.insert(node.id.clone(), Value::Null);
                        }
                        FailurePolicy::Skip => {}
                    },
                }
                queue.complete(index);
            }
            self.store
                .upsert_run(run)
                .await
                .map_err(|e| (None, OrchestratorError::from(e)))?;

            if let Some(failure) = &run.failure {
                log::warn!(
                    "[Orchestrator] run {} aborted by node {}: {}",
                    ctx.run_id,
                    failure.node_id,
                    failure.message
                );
                return Ok((false, accepted));
            }
        }
    }

    /// Ends a run that cannot continue: releases its reservation, marks it
    /// failed and stores it if the store still accepts writes. Returns `err`.
    async fn abandon(
        &self,
        run: &mut Run,
        clock: &RunClock,
        options: &ExecuteOptions,
        node_id: Option<NodeId>,
        err: OrchestratorError,
    ) -> OrchestratorError {
        if options.account_id.is_some() {
            if let Err(e) = self.ledger.refund_all(&run.run_id).await {
                log::error!(
                    "[Orchestrator] run {}: reservation not released: {}",
                    run.run_id,
                    e
                );
            }
        }
        run.status = RunStatus::Failed;
        run.output = None;
        run.provenance.clear();
        run.failure = Some(RunFailure {
            node_id: node_id.unwrap_or_default(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        run.finished_at = Some(clock.tick());
        if let Err(e) = self.store.upsert_run(run).await {
            log::error!("[Orchestrator] run {} not stored: {}", run.run_id, e);
        }
        log::warn!("[Orchestrator] run {} failed: {}", run.run_id, err);
        err
    }

    /// Holds the price of every agent-call node. On failure returns the node
    /// whose hold was refused.
    async fn hold_prices(
        &self,
        chain: &Chain,
        options: &ExecuteOptions,
        account_id: &str,
        run: &mut Run,
    ) -> Result<(), (NodeId, OrchestratorError)> {
        for node in chain.nodes.iter().filter(|n| n.kind == NodeKind::AgentCall) {
            let price = options.price_of(&node.id);
            if price == 0 {
                continue;
            }
            let key = ledger::idempotency_key(&run.run_id, &node.id, "hold");
            match self
                .ledger
                .hold(account_id, price, &key, Some(&run.run_id))
                .await
            {
                Ok(_) => run.reserved_cents += price,
                Err(e) => return Err((node.id.clone(), e.into())),
            }
        }
        Ok(())
    }

    /// Builds the input of node `index` from its parents, the root input and
    /// its template.
    fn prepare<'c>(
        &self,
        chain: &'c Chain,
        graph: &ChainGraph,
        index: usize,
        run: &Run,
        root_input: &Value,
        options: &ExecuteOptions,
    ) -> NodeJob<'c> {
        let node = &chain.nodes[index];
        let parents: Vec<Value> = graph
            .parents(index)
            .iter()
            .map(|&p| match run.node_outputs.get(&chain.nodes[p].id) {
                None | Some(Value::Null) => Value::Object(Map::new()),
                Some(output) => output.clone(),
            })
            .collect();
        let merged = if parents.is_empty() {
            root_input.clone()
        } else {
            node.merge_policy.merge(&parents)
        };

        let (input, unresolved) = match &node.input_template {
            None => (merged, Vec::new()),
            Some(template) => {
                let mut scope: BTreeMap<String, Value> = BTreeMap::new();
                for &ancestor in graph.ancestors(index) {
                    let other = &chain.nodes[ancestor];
                    if let Some(output) = run.node_outputs.get(&other.id) {
                        scope.insert(other.id.clone(), output.clone());
                        if let Some(alias) = &other.alias {
                            scope.insert(alias.clone(), output.clone());
                        }
                    }
                }
                scope.insert("input".to_string(), merged.clone());
                scope.insert("root".to_string(), root_input.clone());
                let resolution = tokens::resolve(template, &scope);
                for token in &resolution.unresolved {
                    log::warn!(
                        "[Orchestrator] node {}: unresolved {} ({})",
                        node.id,
                        token.token,
                        token.reason
                    );
                }
                let input = match (merged, resolution.value) {
                    (Value::Object(mut base), Value::Object(overlay)) => {
                        base.extend(overlay);
                        Value::Object(base)
                    }
                    (_, resolved) => resolved,
                };
                (input, resolution.unresolved)
            }
        };

        NodeJob {
            index,
            node,
            input,
            unresolved,
            price: if node.kind == NodeKind::AgentCall {
                options.price_of(&node.id)
            } else {
                0
            },
        }
    }

    async fn run_node(
        &self,
        ctx: &NodeContext<'_>,
        job: NodeJob<'_>,
    ) -> Result<NodeReport, OrchestratorError> {
        let node = job.node;
        let started_at = ctx.clock.tick();
        let timer = Instant::now();

        let mut oracle_cost = 0;
        let (attempts, transformed) = match &node.input_schema {
            None => {
                let fingerprint = shape_fingerprint(&job.input);
                let attempt = TransformAttempt {
                    method: TransformMethod::Direct,
                    input_fingerprint: fingerprint.clone(),
                    output_fingerprint: fingerprint,
                    compatibility_score: 1.0,
                    cost_cents: 0,
                    accepted: true,
                    note: Some("no input schema".to_string()),
                };
                let accepted = Accepted {
                    payload: job.input.clone(),
                    method: TransformMethod::Direct,
                    score: 1.0,
                };
                (vec![attempt], Ok(accepted))
            }
            Some(schema) => {
                let escalator = Escalator {
                    matcher: &self.matcher,
                    cache: &self.cache,
                    suggestion: self.suggestion.as_deref(),
                    synthesis: self.synthesis.as_deref(),
                    config: &self.config,
                    allow_synthesis: ctx.allow_synthesis,
                };
                let outcome = escalator.escalate(&job.input, schema).await?;
                oracle_cost = outcome.cost_cents;
                let transformed = match (outcome.accepted, outcome.remote_error) {
                    (Some(accepted), _) => Ok(accepted),
                    (None, Some(message)) => Err(NodeError::Remote(message)),
                    (None, None) => Err(NodeError::SchemaIncompatible {
                        best_score: outcome.best_score,
                        errors: outcome.errors,
                    }),
                };
                (outcome.attempts, transformed)
            }
        };
        for attempt in &attempts {
            self.store
                .append_attempt(&AttemptRecord {
                    run_id: ctx.run_id.to_string(),
                    node_id: node.id.clone(),
                    attempt: attempt.clone(),
                })
                .await?;
        }

        let accepted = transformed
            .as_ref()
            .ok()
            .map(|a| (a.method.clone(), a.score));
        let mut status = NodeStatus::Succeeded;
        let mut idempotency_key = None;
        let outcome: Result<Value, NodeError> = match transformed {
            Err(e) => Err(e),
            Ok(input) => match node.kind {
                NodeKind::Transformer => Ok(input.payload),
                NodeKind::AgentCall => {
                    let key = execution_key(ctx.run_id, &node.id, &input.payload);
                    idempotency_key = Some(key.clone());
                    match self.store.find_execution(&key).await? {
                        Some(previous) => {
                            log::info!(
                                "[Orchestrator] node {} replayed from execution log",
                                node.id
                            );
                            status = NodeStatus::Replayed;
                            Ok(previous.response.unwrap_or(Value::Null))
                        }
                        None => self.call_agent(ctx, node, &input.payload, &key).await?,
                    }
                }
            },
        };

        if let (Ok(output), Some(schema)) = (&outcome, &node.output_schema) {
            let report = self.matcher.score(output, schema);
            if !report.valid {
                log::warn!(
                    "[Orchestrator] node {} output does not match its output schema: {}",
                    node.id,
                    report.errors.join("; ")
                );
            }
        }

        if let Err(err) = &outcome {
            status = match node.failure_policy {
                FailurePolicy::Abort => NodeStatus::Failed,
                FailurePolicy::ContinuePartial => NodeStatus::Partial,
                FailurePolicy::Skip => NodeStatus::Skipped,
            };
            log::warn!(
                "[Orchestrator] node {} failed ({:?}): {}",
                node.id,
                node.failure_policy,
                err
            );
        } else {
            log::info!(
                "[Orchestrator] node {} {} via {}",
                node.id,
                if status == NodeStatus::Replayed { "replayed" } else { "succeeded" },
                accepted.as_ref().map(|(m, _)| m.label()).unwrap_or("direct")
            );
        }

        let telemetry = NodeTelemetry {
            node_id: node.id.clone(),
            status,
            method: accepted.as_ref().map(|(m, _)| m.clone()),
            attempts,
            started_at,
            finished_at: ctx.clock.tick(),
            duration_ms: timer.elapsed().as_millis() as u64,
            cost_cents: oracle_cost,
            idempotency_key,
            unresolved_tokens: job.unresolved,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };
        Ok(NodeReport {
            index: job.index,
            telemetry,
            outcome,
            accepted,
            spent_cents: oracle_cost,
            price: job.price,
        })
    }

    /// Settles the price of a node that produced an output and refunds the
    /// price of one that did not. Returns the amount spent.
    async fn settle_node(
        &self,
        account_id: Option<&str>,
        run_id: &str,
        report: &NodeReport,
        node: &Node,
    ) -> Result<i64, OrchestratorError> {
        let Some(account_id) = account_id else {
            return Ok(0);
        };
        if report.price == 0 {
            return Ok(0);
        }
        if report.outcome.is_ok() {
            let key = ledger::idempotency_key(run_id, &node.id, "settle");
            self.ledger
                .settle(account_id, &key, report.price, Some(run_id))
                .await?;
            Ok(report.price)
        } else {
            let key = ledger::idempotency_key(run_id, &node.id, "refund");
            self.ledger
                .refund(account_id, &key, report.price, Some(run_id))
                .await?;
            Ok(0)
        }
    }

    /// Calls the agent under the node's timeout and logs the exchange.
    async fn call_agent(
        &self,
        ctx: &NodeContext<'_>,
        node: &Node,
        payload: &Value,
        key: &str,
    ) -> Result<Result<Value, NodeError>, OrchestratorError> {
        let timeout = Duration::from_millis(node.timeout_ms.unwrap_or(self.config.default_timeout_ms));
        let agent_ref = node.agent_ref.as_deref().unwrap_or_default();
        let started = Instant::now();
        let result = match tokio::time::timeout(
            timeout,
            self.agent.call(agent_ref, payload, key, timeout),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(NodeError::from(e)),
            Err(_) => Err(NodeError::Timeout(timeout.as_millis() as u64)),
        };

        let log_entry = ExecutionLog {
            idempotency_key: key.to_string(),
            run_id: ctx.run_id.to_string(),
            node_id: node.id.clone(),
            request: payload.clone(),
            response: result.as_ref().ok().cloned(),
            duration_ms: started.elapsed().as_millis() as u64,
            status: if result.is_ok() {
                ExecutionStatus::Succeeded
            } else {
                ExecutionStatus::Failed
            },
            error: result.as_ref().err().map(|e| e.to_string()),
            recorded_at: Utc::now(),
        };
        self.store.append_execution_log(&log_entry).await?;
        Ok(result)
    }

    /// Merges terminal outputs and attributes every output field.
    fn finalize_output(
        &self,
        chain: &Chain,
        graph: &ChainGraph,
        run: &Run,
        accepted: &HashMap<usize, (TransformMethod, f64)>,
    ) -> (Value, BTreeMap<String, crate::provenance::ProvenanceRecord>) {
        let terminals: Vec<(usize, &Value)> = graph
            .terminals()
            .into_iter()
            .filter_map(|i| run.node_outputs.get(&chain.nodes[i].id).map(|v| (i, v)))
            .collect();
        let outputs: Vec<Value> = terminals.iter().map(|(_, v)| (*v).clone()).collect();
        let output = chain.final_merge.merge(&outputs);

        let direct = (TransformMethod::Direct, 1.0);
        let contributions: Vec<Contribution<'_>> = chain
            .final_merge
            .precedence(&outputs)
            .into_iter()
            .map(|k| terminals[k])
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| {
                let (method, score) = accepted.get(&i).unwrap_or(&direct);
                Contribution {
                    node_id: chain.nodes[i].id.as_str(),
                    output: v,
                    method,
                    score: *score,
                }
            })
            .collect();
        let mut tracker = ProvenanceTracker::new(self.config.synthesis_trust);
        tracker.attribute(&output, &contributions);
        (output, tracker.into_records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracles::EchoAgent;
    use crate::schema::{DataSchema, FieldType};
    use crate::storage::InMemoryStore;
    use serde_json::json;

    fn orchestrator() -> DagOrchestrator {
        DagOrchestrator::new(Arc::new(InMemoryStore::new()), Arc::new(EchoAgent))
    }

    #[test]
    fn test_execution_key_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(execution_key("r", "n", &a), execution_key("r", "n", &b));
        assert_ne!(execution_key("r", "n", &a), execution_key("r", "m", &a));
    }

    #[test]
    fn test_run_clock_is_strictly_increasing() {
        let clock = RunClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[tokio::test]
    async fn test_template_overlays_merged_input() {
        let chain = Chain::new("overlay")
            .node(Node::transformer("source"))
            .node(
                Node::transformer("shape")
                    .with_alias("Shaper")
                    .with_template(json!({"text": "@source.summary (@root.lang)"}))
                    .with_input_schema(DataSchema::new().require("text", FieldType::String)),
            )
            .edge("source", "shape");
        let result = orchestrator()
            .execute(&chain, json!({"summary": "ok", "lang": "en"}), ExecuteOptions::new())
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(
            result.output().unwrap(),
            &json!({"summary": "ok", "lang": "en", "text": "ok (en)"})
        );
        let provenance = &result.run.provenance["text"];
        assert_eq!(provenance.origin, "shape");
        assert_eq!(provenance.method, TransformMethod::Direct);
    }

    #[tokio::test]
    async fn test_into_result_reports_abort() {
        let chain = Chain::new("abort").node(
            Node::transformer("strict")
                .with_input_schema(DataSchema::new().require("text", FieldType::String)),
        );
        let result = orchestrator()
            .execute(&chain, json!({"nothing": true}), ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(result.status(), RunStatus::Failed);
        assert!(result.output().is_none());
        match result.into_result() {
            Err(OrchestratorError::NodeAborted { node_id, kind, .. }) => {
                assert_eq!(node_id, "strict");
                assert_eq!(kind, "schema_incompatible");
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }
}
