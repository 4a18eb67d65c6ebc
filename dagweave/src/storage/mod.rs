//! Persistence port
//!
//! The orchestrator, the mapping cache and the ledger never hold state of
//! their own: everything goes through a [`PersistencePort`] injected as
//! `Arc<dyn PersistencePort>`, so several orchestrator instances can share
//! one store.
//!
//! Backends:
//! - [`InMemoryStore`]: mutex-guarded maps, for tests and single-process use
//! - [`SqliteStore`]: SQLite file or in-memory database with a unique
//!   constraint on ledger idempotency keys

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::ledger::{
    AccountState, LedgerEntry, LedgerError, LedgerKind, LedgerOutcome, LedgerRequest,
    RunReservation,
};
use crate::recipes::MappingRecipe;
use crate::types::{ExecutionLog, Run, TransformAttempt};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store lock poisoned: {0}")]
    Poisoned(String),
    #[error("Invalid data: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A transform attempt together with the run and node it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub run_id: String,
    pub node_id: String,
    pub attempt: TransformAttempt,
}

/// Transactional store consumed by the orchestrator core.
///
/// Implementations must be safe to share between concurrent runs. Counter
/// and balance updates are performed inside the store so that no caller
/// ever does an unguarded read-modify-write.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    // Runs
    async fn upsert_run(&self, run: &Run) -> StoreResult<()>;
    async fn load_run(&self, run_id: &str) -> StoreResult<Option<Run>>;

    // Audit trail
    async fn append_attempt(&self, record: &AttemptRecord) -> StoreResult<()>;
    async fn attempts_for_run(&self, run_id: &str) -> StoreResult<Vec<AttemptRecord>>;
    async fn append_execution_log(&self, log: &ExecutionLog) -> StoreResult<()>;
    /// First successful execution recorded under `idempotency_key`.
    async fn find_execution(&self, idempotency_key: &str) -> StoreResult<Option<ExecutionLog>>;

    // Mapping recipes
    async fn recipes_for(
        &self,
        source_fingerprint: &str,
        target_fingerprint: &str,
    ) -> StoreResult<Vec<MappingRecipe>>;
    async fn get_recipe(&self, recipe_id: &str) -> StoreResult<Option<MappingRecipe>>;
    /// Inserts the recipe if unknown, then atomically increments its success
    /// or failure counter. Returns the stored recipe after the update.
    async fn record_recipe_outcome(
        &self,
        recipe: &MappingRecipe,
        success: bool,
    ) -> StoreResult<MappingRecipe>;

    // Ledger
    async fn ledger_account(&self, account_id: &str) -> StoreResult<Option<AccountState>>;
    async fn ledger_entry(
        &self,
        idempotency_key: &str,
        kind: LedgerKind,
    ) -> StoreResult<Option<LedgerEntry>>;
    async fn run_reservation(&self, run_id: &str) -> StoreResult<Option<RunReservation>>;
    /// Applies `request` exactly once per `(idempotency key, kind)`. A pair
    /// that was already applied returns the recorded entry with
    /// `replayed = true`.
    async fn apply_ledger(&self, request: &LedgerRequest) -> Result<LedgerOutcome, LedgerError>;
}
