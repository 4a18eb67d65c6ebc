//! Idempotent ledger
//!
//! Integer-cent balance bookkeeping for runs. Every mutation carries a
//! deterministic idempotency key; applying the same key and kind a second
//! time returns the entry recorded the first time and changes nothing. A hold
//! and the settle that releases it may share one caller key.
//!
//! ```text
//!   available = balance - reserved
//!
//!   hold      reserved += amount            (fails if available < amount)
//!   settle    reserved -= amount            (floored at 0)
//!   refund    reserved -= amount; balance += amount
//!   refund_all  refund of the run's remaining reservation
//!   top_up    balance += amount
//! ```
//!
//! Atomicity is delegated to the [`PersistencePort`]: the check for a prior
//! entry, the state transition and the insert of the new entry happen in one
//! critical section of the store.

mod types;

pub use types::{
    AccountState, Applied, EntryStatus, LedgerEntry, LedgerKind, LedgerOp, LedgerOutcome,
    LedgerRequest, RunReservation,
};

use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::storage::{PersistencePort, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient funds on '{account_id}': requested {requested_cents}, available {available_cents}")]
    InsufficientFunds {
        account_id: String,
        requested_cents: i64,
        available_cents: i64,
    },
    #[error("Unknown account: {0}")]
    UnknownAccount(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),
    #[error("Ledger storage error: {0}")]
    Store(#[from] StoreError),
}

/// Deterministic idempotency key for a ledger operation of a node in a run.
pub fn idempotency_key(run_id: &str, node_id: &str, operation: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(node_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(operation.as_bytes());
    format!("{}-{:x}", operation, hasher.finalize())
}

fn refund_all_key(run_id: &str) -> String {
    format!("refund-all:{}", run_id)
}

/// Ledger operations over a shared store.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn PersistencePort>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn PersistencePort>) -> Self {
        Self { store }
    }

    async fn commit(&self, request: LedgerRequest) -> Result<LedgerEntry, LedgerError> {
        let outcome = self.store.apply_ledger(&request).await?;
        if outcome.replayed {
            log::debug!(
                "[Ledger] replayed {} key={} account={}",
                outcome.entry.kind.as_str(),
                request.idempotency_key,
                request.account_id
            );
        } else {
            log::info!(
                "[Ledger] {} {}c account={} balance={} reserved={}",
                outcome.entry.kind.as_str(),
                outcome.entry.amount_cents,
                outcome.entry.account_id,
                outcome.entry.balance_after_cents,
                outcome.entry.reserved_after_cents
            );
        }
        Ok(outcome.entry)
    }

    /// Reserves `amount_cents`. A replay returns the original hold without
    /// re-checking the balance.
    pub async fn hold(
        &self,
        account_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
        run_id: Option<&str>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.commit(LedgerRequest {
            idempotency_key: idempotency_key.to_string(),
            account_id: account_id.to_string(),
            run_id: run_id.map(str::to_string),
            op: LedgerOp::Hold { amount_cents },
        })
        .await
    }

    /// Releases a reservation as spent. Does not touch the balance.
    pub async fn settle(
        &self,
        account_id: &str,
        idempotency_key: &str,
        amount_cents: i64,
        run_id: Option<&str>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.commit(LedgerRequest {
            idempotency_key: idempotency_key.to_string(),
            account_id: account_id.to_string(),
            run_id: run_id.map(str::to_string),
            op: LedgerOp::Settle { amount_cents },
        })
        .await
    }

    /// Releases a reservation and credits the amount back to the balance.
    pub async fn refund(
        &self,
        account_id: &str,
        idempotency_key: &str,
        amount_cents: i64,
        run_id: Option<&str>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.commit(LedgerRequest {
            idempotency_key: idempotency_key.to_string(),
            account_id: account_id.to_string(),
            run_id: run_id.map(str::to_string),
            op: LedgerOp::Refund { amount_cents },
        })
        .await
    }

    /// Refunds everything the run still has reserved, keyed by the run id
    /// alone. Returns `None` when the run never reserved anything.
    pub async fn refund_all(&self, run_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let key = refund_all_key(run_id);
        let kind = LedgerOp::RefundRun.kind();
        if let Some(entry) = self.store.ledger_entry(&key, kind).await? {
            return Ok(Some(entry));
        }
        let Some(reservation) = self.store.run_reservation(run_id).await? else {
            return Ok(None);
        };
        let entry = self
            .commit(LedgerRequest {
                idempotency_key: key,
                account_id: reservation.account_id,
                run_id: Some(run_id.to_string()),
                op: LedgerOp::RefundRun,
            })
            .await?;
        Ok(Some(entry))
    }

    pub async fn top_up(
        &self,
        account_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        self.commit(LedgerRequest {
            idempotency_key: idempotency_key.to_string(),
            account_id: account_id.to_string(),
            run_id: None,
            op: LedgerOp::Topup { amount_cents },
        })
        .await
    }

    pub async fn account(&self, account_id: &str) -> Result<Option<AccountState>, LedgerError> {
        Ok(self.store.ledger_account(account_id).await?)
    }

    pub async fn reservation(&self, run_id: &str) -> Result<Option<RunReservation>, LedgerError> {
        Ok(self.store.run_reservation(run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    async fn funded_ledger(balance: i64) -> LedgerService {
        let ledger = LedgerService::new(Arc::new(InMemoryStore::new()));
        ledger.top_up("run1", balance, "seed").await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_hold_twice_reserves_once_then_settle() {
        let ledger = funded_ledger(1000).await;
        ledger.hold("run1", 400, "key1", None).await.unwrap();
        ledger.hold("run1", 400, "key1", None).await.unwrap();
        let acct = ledger.account("run1").await.unwrap().unwrap();
        assert_eq!(acct.reserved_cents, 400);

        let settle = ledger.settle("run1", "key1", 400, None).await.unwrap();
        assert_eq!(settle.kind, LedgerKind::Settle);
        let acct = ledger.account("run1").await.unwrap().unwrap();
        assert_eq!(acct.reserved_cents, 0);
        assert_eq!(acct.balance_cents, 1000);

        // A second settle under the same key is a replay
        let replay = ledger.settle("run1", "key1", 400, None).await.unwrap();
        assert_eq!(settle, replay);
    }

    #[tokio::test]
    async fn test_same_key_across_kinds_records_separate_entries() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = LedgerService::new(store.clone());
        ledger.top_up("run1", 1000, "seed").await.unwrap();
        ledger.hold("run1", 300, "shared", Some("r")).await.unwrap();
        ledger.refund("run1", "shared", 300, Some("r")).await.unwrap();

        let kinds: Vec<LedgerKind> = store
            .ledger_entries()
            .into_iter()
            .filter(|e| e.idempotency_key == "shared")
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&LedgerKind::Hold));
        assert!(kinds.contains(&LedgerKind::Refund));
        let acct = ledger.account("run1").await.unwrap().unwrap();
        assert_eq!((acct.balance_cents, acct.reserved_cents), (1300, 0));
    }

    #[tokio::test]
    async fn test_replayed_hold_skips_balance_check() {
        let ledger = funded_ledger(500).await;
        let first = ledger.hold("run1", 500, "h", None).await.unwrap();
        // Balance is now fully reserved; a fresh hold would fail
        assert!(matches!(
            ledger.hold("run1", 1, "other", None).await,
            Err(LedgerError::InsufficientFunds { .. })
        ));
        let replay = ledger.hold("run1", 500, "h", None).await.unwrap();
        assert_eq!(first, replay);
    }

    #[tokio::test]
    async fn test_refund_and_replay() {
        let ledger = funded_ledger(1000).await;
        ledger.hold("run1", 300, "h", Some("r")).await.unwrap();
        ledger.refund("run1", "rf", 300, Some("r")).await.unwrap();
        let after_first = ledger.account("run1").await.unwrap().unwrap();
        ledger.refund("run1", "rf", 300, Some("r")).await.unwrap();
        let after_second = ledger.account("run1").await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.reserved_cents, 0);
        assert_eq!(after_second.balance_cents, 1300);
    }

    #[tokio::test]
    async fn test_refund_all_releases_run_reservation_once() {
        let ledger = funded_ledger(1000).await;
        ledger.hold("run1", 100, "a", Some("r")).await.unwrap();
        ledger.hold("run1", 250, "b", Some("r")).await.unwrap();
        ledger.hold("run1", 50, "c", Some("other")).await.unwrap();

        let entry = ledger.refund_all("r").await.unwrap().unwrap();
        assert_eq!(entry.amount_cents, 350);
        let again = ledger.refund_all("r").await.unwrap().unwrap();
        assert_eq!(entry, again);

        let acct = ledger.account("run1").await.unwrap().unwrap();
        assert_eq!(acct.reserved_cents, 50);
        assert!(ledger.refund_all("never-held").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_retries_apply_once() {
        let ledger = funded_ledger(1000).await;
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.hold("run1", 100, "same-key", None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let acct = ledger.account("run1").await.unwrap().unwrap();
        assert_eq!(acct.reserved_cents, 100);
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        assert_eq!(
            idempotency_key("run", "node", "hold"),
            idempotency_key("run", "node", "hold")
        );
        assert_ne!(
            idempotency_key("run", "node", "hold"),
            idempotency_key("run", "node", "settle")
        );
        assert!(idempotency_key("r", "n", "hold").starts_with("hold-"));
    }
}
