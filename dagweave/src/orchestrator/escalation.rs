//! Transform escalation
//!
//! ```text
//!   direct ──► cached recipes ──► deterministic ──► suggested ──► synthesized
//!   (score)    (success desc)     (alias mapper)    (confidence    (opt-in,
//!                                                    desc)          bounded retry)
//! ```
//!
//! Each tier proposes zero or more candidate payloads. Every candidate is
//! re-scored against the target schema and recorded as a
//! [`TransformAttempt`]; the first one at or above the acceptance threshold
//! wins and later tiers are not consulted.

use serde_json::Value;
use std::collections::HashSet;

use crate::config::OrchestratorConfig;
use crate::oracles::{SuggestionOracle, SynthesisOracle, SynthesisOutcome, SynthesisRequest, SynthesisSettings};
use crate::recipes::{MappingCache, MappingRecipe, RecipeOrigin};
use crate::schema::{schema_fingerprint, shape_fingerprint, DataSchema, MatchReport, SchemaMatcher};
use crate::storage::StoreError;
use crate::types::{TransformAttempt, TransformMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Direct,
    Cached,
    Deterministic,
    Suggested,
    Synthesized,
}

const TIERS: [Tier; 5] = [
    Tier::Direct,
    Tier::Cached,
    Tier::Deterministic,
    Tier::Suggested,
    Tier::Synthesized,
];

/// The payload a node will be called with.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub payload: Value,
    pub method: TransformMethod,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EscalationOutcome {
    pub accepted: Option<Accepted>,
    pub attempts: Vec<TransformAttempt>,
    /// Oracle charges incurred while escalating
    pub cost_cents: i64,
    pub best_score: f64,
    /// Direct-match errors followed by one note per failed tier
    pub errors: Vec<String>,
    /// Set when the synthesis oracle itself failed rather than declining
    pub remote_error: Option<String>,
}

pub struct Escalator<'a> {
    pub matcher: &'a SchemaMatcher,
    pub cache: &'a MappingCache,
    pub suggestion: Option<&'a dyn SuggestionOracle>,
    pub synthesis: Option<&'a dyn SynthesisOracle>,
    pub config: &'a OrchestratorConfig,
    pub allow_synthesis: bool,
}

/// Per-call bookkeeping shared by the tiers.
struct Attempts<'s> {
    matcher: &'s SchemaMatcher,
    schema: &'s DataSchema,
    threshold: f64,
    input_fingerprint: String,
    outcome: EscalationOutcome,
}

impl Attempts<'_> {
    /// Scores `candidate`, records the attempt and returns the report.
    fn try_candidate(
        &mut self,
        candidate: &Value,
        method: TransformMethod,
        cost_cents: i64,
        note: Option<String>,
    ) -> (bool, MatchReport) {
        let report = self.matcher.score(candidate, self.schema);
        let accepted = report.score >= self.threshold;
        if report.score > self.outcome.best_score {
            self.outcome.best_score = report.score;
        }
        log::debug!(
            "[Escalation] {} scored {:.3} (threshold {:.2}){}",
            method.label(),
            report.score,
            self.threshold,
            if accepted { " -> accepted" } else { "" }
        );
        self.outcome.cost_cents += cost_cents;
        self.outcome.attempts.push(TransformAttempt {
            method: method.clone(),
            input_fingerprint: self.input_fingerprint.clone(),
            output_fingerprint: shape_fingerprint(candidate),
            compatibility_score: report.score,
            cost_cents,
            accepted,
            note,
        });
        if accepted {
            self.outcome.accepted = Some(Accepted {
                payload: candidate.clone(),
                method,
                score: report.score,
            });
        }
        (accepted, report)
    }

    fn note(&mut self, message: String) {
        self.outcome.errors.push(message);
    }
}

impl<'a> Escalator<'a> {
    /// Finds the first acceptable payload for `schema`. Store failures are
    /// returned as errors; everything else ends up in the outcome.
    pub async fn escalate(
        &self,
        payload: &Value,
        schema: &DataSchema,
    ) -> Result<EscalationOutcome, StoreError> {
        let src_fp = shape_fingerprint(payload);
        let dst_fp = schema_fingerprint(schema);
        let mut state = Attempts {
            matcher: self.matcher,
            schema,
            threshold: self.config.acceptance_threshold,
            input_fingerprint: src_fp.clone(),
            outcome: EscalationOutcome::default(),
        };
        let mut tried: HashSet<String> = HashSet::new();

        for tier in TIERS {
            match tier {
                Tier::Direct => {
                    let (_, report) = state.try_candidate(payload, TransformMethod::Direct, 0, None);
                    state.outcome.errors.extend(report.errors);
                }
                Tier::Cached => {
                    self.try_cached(&mut state, payload, &src_fp, &dst_fp, &mut tried)
                        .await?
                }
                Tier::Deterministic => {
                    self.try_deterministic(&mut state, payload, schema, &src_fp, &dst_fp, &tried)
                        .await?
                }
                Tier::Suggested => {
                    self.try_suggested(&mut state, payload, &src_fp, &dst_fp, &tried)
                        .await?
                }
                Tier::Synthesized => self.try_synthesized(&mut state, payload, schema).await,
            }
            if state.outcome.accepted.is_some() {
                break;
            }
        }
        Ok(state.outcome)
    }

    async fn try_cached(
        &self,
        state: &mut Attempts<'_>,
        payload: &Value,
        src_fp: &str,
        dst_fp: &str,
        tried: &mut HashSet<String>,
    ) -> Result<(), StoreError> {
        let recipes = self.cache.lookup(src_fp, dst_fp).await?;
        if recipes.is_empty() {
            return Ok(());
        }
        for recipe in recipes {
            tried.insert(recipe.id.clone());
            let candidate = recipe.apply(payload);
            let method = TransformMethod::CachedRecipe {
                recipe_id: recipe.id.clone(),
            };
            let (accepted, _) = state.try_candidate(&candidate, method, 0, None);
            self.cache.record(&recipe, accepted).await?;
            if accepted {
                return Ok(());
            }
        }
        state.note("no cached recipe reached the threshold".to_string());
        Ok(())
    }

    async fn try_deterministic(
        &self,
        state: &mut Attempts<'_>,
        payload: &Value,
        schema: &DataSchema,
        src_fp: &str,
        dst_fp: &str,
        tried: &HashSet<String>,
    ) -> Result<(), StoreError> {
        let Some(mapping) = self.matcher.build_deterministic_mapping(payload, schema) else {
            state.note("deterministic mapping found no source for a required field".to_string());
            return Ok(());
        };
        let recipe = mapping.to_recipe(src_fp, dst_fp);
        if tried.contains(&recipe.id) {
            // Same ops as a cached recipe that already failed
            state.note("deterministic mapping matches a rejected cached recipe".to_string());
            return Ok(());
        }
        let note = mapping
            .bindings
            .iter()
            .map(|b| format!("{}<-{}", b.target, b.source))
            .collect::<Vec<_>>()
            .join(",");
        let (accepted, _) =
            state.try_candidate(&mapping.payload, TransformMethod::Deterministic, 0, Some(note));
        if accepted {
            self.cache.record(&recipe, true).await?;
        } else {
            state.note("deterministic mapping scored below the threshold".to_string());
        }
        Ok(())
    }

    async fn try_suggested(
        &self,
        state: &mut Attempts<'_>,
        payload: &Value,
        src_fp: &str,
        dst_fp: &str,
        tried: &HashSet<String>,
    ) -> Result<(), StoreError> {
        let Some(oracle) = self.suggestion else {
            return Ok(());
        };
        let mut suggestions = match oracle.suggest(src_fp, dst_fp, payload).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[Escalation] suggestion oracle failed: {}", e);
                state.outcome.cost_cents += self.config.suggestion_cost_cents;
                state.note(format!("suggestion oracle error: {}", e));
                return Ok(());
            }
        };
        if suggestions.is_empty() {
            state.outcome.cost_cents += self.config.suggestion_cost_cents;
            state.note("suggestion oracle returned no recipes".to_string());
            return Ok(());
        }
        // Oracle output is never trusted as-is: re-sort and re-score
        suggestions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut cost = self.config.suggestion_cost_cents;
        for suggestion in suggestions {
            let recipe = MappingRecipe {
                origin: RecipeOrigin::Suggested,
                success_count: 0,
                fail_count: 0,
                ..suggestion.recipe
            }
            .rekeyed(src_fp, dst_fp);
            if tried.contains(&recipe.id) {
                continue;
            }
            let candidate = recipe.apply(payload);
            let method = TransformMethod::Suggested {
                recipe_id: recipe.id.clone(),
                confidence: suggestion.confidence.clamp(0.0, 1.0),
            };
            // The oracle charge is booked on the first attempt it produced
            let (accepted, _) = state.try_candidate(&candidate, method, cost, None);
            cost = 0;
            if accepted {
                self.cache.record(&recipe, true).await?;
                return Ok(());
            }
        }
        state.outcome.cost_cents += cost;
        state.note("no suggested recipe reached the threshold".to_string());
        Ok(())
    }

    async fn try_synthesized(&self, state: &mut Attempts<'_>, payload: &Value, schema: &DataSchema) {
        if !self.allow_synthesis {
            return;
        }
        let Some(oracle) = self.synthesis else {
            return;
        };
        let mut prior_errors: Vec<String> = Vec::new();
        for attempt in 1..=self.config.synthesis_max_attempts {
            let request = SynthesisRequest {
                source: payload.clone(),
                target_schema: schema.to_json().clone(),
                prior_errors: prior_errors.clone(),
                attempt,
                settings: SynthesisSettings::default(),
            };
            match oracle.synthesize(&request).await {
                Ok(SynthesisOutcome::Payload(candidate)) => {
                    let (accepted, report) = state.try_candidate(
                        &candidate,
                        TransformMethod::Synthesized,
                        self.config.synthesis_cost_cents,
                        Some(format!("attempt {}", attempt)),
                    );
                    if accepted {
                        return;
                    }
                    prior_errors = report.errors;
                    if prior_errors.is_empty() {
                        prior_errors.push(format!(
                            "score {:.3} is below {:.2}",
                            report.score, self.config.acceptance_threshold
                        ));
                    }
                }
                Ok(SynthesisOutcome::ExplicitFailure { reason }) => {
                    state.outcome.cost_cents += self.config.synthesis_cost_cents;
                    state.note(format!("synthesis declined: {}", reason));
                    return;
                }
                Err(e) => {
                    log::warn!("[Escalation] synthesis oracle failed: {}", e);
                    state.outcome.cost_cents += self.config.synthesis_cost_cents;
                    state.note(format!("synthesis oracle error: {}", e));
                    state.outcome.remote_error = Some(format!("synthesis oracle: {}", e));
                    return;
                }
            }
        }
        state.note(format!(
            "synthesis did not reach the threshold in {} attempts",
            self.config.synthesis_max_attempts
        ));
    }
}
