use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{AttemptRecord, PersistencePort, StoreError, StoreResult};
use crate::ledger::{
    AccountState, LedgerEntry, LedgerError, LedgerKind, LedgerOutcome, LedgerRequest,
    RunReservation,
};
use crate::recipes::MappingRecipe;
use crate::types::{ExecutionLog, ExecutionStatus, Run};

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<String, Run>,
    attempts: Vec<AttemptRecord>,
    execution_logs: Vec<ExecutionLog>,
    recipes: HashMap<String, MappingRecipe>,
    accounts: HashMap<String, AccountState>,
    entries: HashMap<(String, LedgerKind), LedgerEntry>,
    reservations: HashMap<String, RunReservation>,
}

/// Process-local store. Every operation takes one mutex, which serializes
/// all ledger and counter updates.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    /// Number of execution logs recorded (all statuses).
    pub fn execution_log_count(&self) -> usize {
        self.lock().map(|g| g.execution_logs.len()).unwrap_or(0)
    }

    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .lock()
            .map(|g| g.entries.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        entries
    }
}

#[async_trait]
impl PersistencePort for InMemoryStore {
    async fn upsert_run(&self, run: &Run) -> StoreResult<()> {
        self.lock()?.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> StoreResult<Option<Run>> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn append_attempt(&self, record: &AttemptRecord) -> StoreResult<()> {
        self.lock()?.attempts.push(record.clone());
        Ok(())
    }

    async fn attempts_for_run(&self, run_id: &str) -> StoreResult<Vec<AttemptRecord>> {
        Ok(self
            .lock()?
            .attempts
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn append_execution_log(&self, log: &ExecutionLog) -> StoreResult<()> {
        self.lock()?.execution_logs.push(log.clone());
        Ok(())
    }

    async fn find_execution(&self, idempotency_key: &str) -> StoreResult<Option<ExecutionLog>> {
        Ok(self
            .lock()?
            .execution_logs
            .iter()
            .find(|l| l.idempotency_key == idempotency_key && l.status == ExecutionStatus::Succeeded)
            .cloned())
    }

    async fn recipes_for(
        &self,
        source_fingerprint: &str,
        target_fingerprint: &str,
    ) -> StoreResult<Vec<MappingRecipe>> {
        Ok(self
            .lock()?
            .recipes
            .values()
            .filter(|r| {
                r.source_fingerprint == source_fingerprint
                    && r.target_fingerprint == target_fingerprint
            })
            .cloned()
            .collect())
    }

    async fn get_recipe(&self, recipe_id: &str) -> StoreResult<Option<MappingRecipe>> {
        Ok(self.lock()?.recipes.get(recipe_id).cloned())
    }

    async fn record_recipe_outcome(
        &self,
        recipe: &MappingRecipe,
        success: bool,
    ) -> StoreResult<MappingRecipe> {
        let mut guard = self.lock()?;
        let stored = guard
            .recipes
            .entry(recipe.id.clone())
            .or_insert_with(|| MappingRecipe {
                success_count: 0,
                fail_count: 0,
                ..recipe.clone()
            });
        if success {
            stored.success_count += 1;
        } else {
            stored.fail_count += 1;
        }
        Ok(stored.clone())
    }

    async fn ledger_account(&self, account_id: &str) -> StoreResult<Option<AccountState>> {
        Ok(self.lock()?.accounts.get(account_id).cloned())
    }

    async fn ledger_entry(
        &self,
        idempotency_key: &str,
        kind: LedgerKind,
    ) -> StoreResult<Option<LedgerEntry>> {
        Ok(self
            .lock()?
            .entries
            .get(&(idempotency_key.to_string(), kind))
            .cloned())
    }

    async fn run_reservation(&self, run_id: &str) -> StoreResult<Option<RunReservation>> {
        Ok(self.lock()?.reservations.get(run_id).cloned())
    }

    async fn apply_ledger(&self, request: &LedgerRequest) -> Result<LedgerOutcome, LedgerError> {
        let mut guard = self.lock()?;
        let entry_key = (request.idempotency_key.clone(), request.op.kind());
        if let Some(existing) = guard.entries.get(&entry_key) {
            if existing.account_id != request.account_id {
                log::warn!(
                    "[Ledger] key {} replayed with different arguments; returning original entry",
                    request.idempotency_key
                );
            }
            return Ok(LedgerOutcome {
                entry: existing.clone(),
                replayed: true,
            });
        }

        let account = guard.accounts.get(&request.account_id).cloned();
        let run_reserved = request
            .run_id
            .as_ref()
            .and_then(|r| guard.reservations.get(r))
            .map(|r| r.reserved_cents)
            .unwrap_or(0);

        let applied = request.apply_to(account, run_reserved, Utc::now())?;

        let inner = &mut *guard;
        if let Some(run_id) = &request.run_id {
            inner
                .reservations
                .entry(run_id.clone())
                .or_insert_with(|| RunReservation {
                    run_id: run_id.clone(),
                    account_id: request.account_id.clone(),
                    reserved_cents: 0,
                })
                .reserved_cents = applied.run_reserved_cents;
        }
        inner
            .accounts
            .insert(applied.account.account_id.clone(), applied.account);
        inner.entries.insert(entry_key, applied.entry.clone());

        Ok(LedgerOutcome {
            entry: applied.entry,
            replayed: false,
        })
    }
}
