//! Orchestrator configuration
//!
//! Every knob has a default, so an empty TOML file is a valid config.
//! Values are loaded from TOML and can be overridden per field through
//! `DAGWEAVE_*` environment variables:
//!
//! ```toml
//! acceptance_threshold = 0.85
//! max_workers = 5
//! default_timeout_ms = 30000
//!
//! [weights]
//! required = 0.6
//! type_match = 0.2
//! validation = 0.2
//!
//! [extra_aliases]
//! text = ["transcript", "caption"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::provenance::DEFAULT_SYNTHESIS_TRUST;
use crate::schema::{AliasTable, SchemaMatcher, ScoreWeights};

pub const ENV_PREFIX: &str = "DAGWEAVE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Minimum compatibility score for a payload to be used as node input
    pub acceptance_threshold: f64,
    pub weights: ScoreWeights,
    /// Upper bound on nodes executed concurrently in one batch
    pub max_workers: usize,
    /// Agent call timeout for nodes without an override
    pub default_timeout_ms: u64,
    /// Attempts given to the synthesis oracle per node
    pub synthesis_max_attempts: u32,
    /// Confidence multiplier for synthesized payloads
    pub synthesis_trust: f64,
    pub suggestion_cost_cents: i64,
    pub synthesis_cost_cents: i64,
    /// Extra source keys per target field for the deterministic mapper
    pub extra_aliases: BTreeMap<String, Vec<String>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.85,
            weights: ScoreWeights::default(),
            max_workers: 5,
            default_timeout_ms: 30_000,
            synthesis_max_attempts: 2,
            synthesis_trust: DEFAULT_SYNTHESIS_TRUST,
            suggestion_cost_cents: 0,
            synthesis_cost_cents: 0,
            extra_aliases: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        log::info!(
            "[Config] Loaded orchestrator config from {}",
            path.as_ref().display()
        );
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `DAGWEAVE_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            name: &str,
        ) -> Result<Option<T>, ConfigError> {
            let key = format!("{}{}", ENV_PREFIX, name);
            match lookup(&key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        if let Some(v) = parsed(lookup, "ACCEPTANCE_THRESHOLD")? {
            self.acceptance_threshold = v;
        }
        if let Some(v) = parsed(lookup, "WEIGHT_REQUIRED")? {
            self.weights.required = v;
        }
        if let Some(v) = parsed(lookup, "WEIGHT_TYPE_MATCH")? {
            self.weights.type_match = v;
        }
        if let Some(v) = parsed(lookup, "WEIGHT_VALIDATION")? {
            self.weights.validation = v;
        }
        if let Some(v) = parsed(lookup, "MAX_WORKERS")? {
            self.max_workers = v;
        }
        if let Some(v) = parsed(lookup, "DEFAULT_TIMEOUT_MS")? {
            self.default_timeout_ms = v;
        }
        if let Some(v) = parsed(lookup, "SYNTHESIS_MAX_ATTEMPTS")? {
            self.synthesis_max_attempts = v;
        }
        if let Some(v) = parsed(lookup, "SYNTHESIS_TRUST")? {
            self.synthesis_trust = v;
        }
        if let Some(v) = parsed(lookup, "SUGGESTION_COST_CENTS")? {
            self.suggestion_cost_cents = v;
        }
        if let Some(v) = parsed(lookup, "SYNTHESIS_COST_CENTS")? {
            self.synthesis_cost_cents = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.weights;
        if w.required < 0.0 || w.type_match < 0.0 || w.validation < 0.0 {
            return Err(ConfigError::Invalid("score weights must be non-negative".into()));
        }
        if (w.total() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "score weights must sum to 1.0, got {:.4}",
                w.total()
            )));
        }
        if !(self.acceptance_threshold > 0.0 && self.acceptance_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "acceptance_threshold must be in (0, 1], got {}",
                self.acceptance_threshold
            )));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.synthesis_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "synthesis_max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.synthesis_trust) {
            return Err(ConfigError::Invalid(format!(
                "synthesis_trust must be in [0, 1], got {}",
                self.synthesis_trust
            )));
        }
        if self.suggestion_cost_cents < 0 || self.synthesis_cost_cents < 0 {
            return Err(ConfigError::Invalid("oracle costs must be non-negative".into()));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Matcher with the configured weights and the default alias table
    /// extended by `extra_aliases`.
    pub fn matcher(&self) -> SchemaMatcher {
        SchemaMatcher::new(
            self.weights,
            AliasTable::default().with_extra(&self.extra_aliases),
        )
    }
}
