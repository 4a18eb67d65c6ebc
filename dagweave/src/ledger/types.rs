use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LedgerError;

/// Balance state of one account. `available = balance - reserved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub account_id: String,
    pub balance_cents: i64,
    pub reserved_cents: i64,
}

impl AccountState {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            balance_cents: 0,
            reserved_cents: 0,
        }
    }

    pub fn available_cents(&self) -> i64 {
        self.balance_cents - self.reserved_cents
    }
}

/// Amount currently reserved on behalf of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReservation {
    pub run_id: String,
    pub account_id: String,
    pub reserved_cents: i64,
}

/// Kind of a recorded ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Hold,
    Settle,
    Refund,
    Topup,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::Settle => "settle",
            Self::Refund => "refund",
            Self::Topup => "topup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hold" => Some(Self::Hold),
            "settle" => Some(Self::Settle),
            "refund" => Some(Self::Refund),
            "topup" => Some(Self::Topup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Applied,
}

/// The mutation a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    Hold { amount_cents: i64 },
    Settle { amount_cents: i64 },
    Refund { amount_cents: i64 },
    /// Refund whatever the run still has reserved; amount resolved atomically
    RefundRun,
    Topup { amount_cents: i64 },
}

impl LedgerOp {
    pub fn kind(&self) -> LedgerKind {
        match self {
            Self::Hold { .. } => LedgerKind::Hold,
            Self::Settle { .. } => LedgerKind::Settle,
            Self::Refund { .. } | Self::RefundRun => LedgerKind::Refund,
            Self::Topup { .. } => LedgerKind::Topup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRequest {
    pub idempotency_key: String,
    pub account_id: String,
    pub run_id: Option<String>,
    pub op: LedgerOp,
}

/// A recorded, applied ledger mutation. Replays return this record verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub idempotency_key: String,
    pub account_id: String,
    pub run_id: Option<String>,
    pub kind: LedgerKind,
    pub amount_cents: i64,
    pub status: EntryStatus,
    pub balance_after_cents: i64,
    pub reserved_after_cents: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutcome {
    pub entry: LedgerEntry,
    /// True when the key had already been applied and nothing changed
    pub replayed: bool,
}

/// New state produced by applying a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub account: AccountState,
    pub run_reserved_cents: i64,
    pub entry: LedgerEntry,
}

impl LedgerRequest {
    /// Pure state transition. Stores call this inside their critical section
    /// after checking that the key has not been applied yet.
    pub fn apply_to(
        &self,
        account: Option<AccountState>,
        run_reserved_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<Applied, LedgerError> {
        let mut account = match (account, &self.op) {
            (Some(a), _) => a,
            (None, LedgerOp::Topup { .. }) => AccountState::new(self.account_id.clone()),
            (None, _) => return Err(LedgerError::UnknownAccount(self.account_id.clone())),
        };
        let mut run_reserved = run_reserved_cents;

        let amount = match self.op {
            LedgerOp::Hold { amount_cents }
            | LedgerOp::Settle { amount_cents }
            | LedgerOp::Refund { amount_cents }
            | LedgerOp::Topup { amount_cents } => {
                if amount_cents < 0 {
                    return Err(LedgerError::InvalidAmount(amount_cents));
                }
                amount_cents
            }
            LedgerOp::RefundRun => run_reserved,
        };

        match self.op {
            LedgerOp::Hold { .. } => {
                let available = account.available_cents();
                if available < amount {
                    return Err(LedgerError::InsufficientFunds {
                        account_id: account.account_id.clone(),
                        requested_cents: amount,
                        available_cents: available,
                    });
                }
                account.reserved_cents += amount;
                run_reserved += amount;
            }
            LedgerOp::Settle { .. } => {
                account.reserved_cents = (account.reserved_cents - amount).max(0);
                run_reserved = (run_reserved - amount).max(0);
            }
            LedgerOp::Refund { .. } | LedgerOp::RefundRun => {
                account.reserved_cents = (account.reserved_cents - amount).max(0);
                account.balance_cents += amount;
                run_reserved = (run_reserved - amount).max(0);
            }
            LedgerOp::Topup { .. } => {
                account.balance_cents += amount;
            }
        }

        let entry = LedgerEntry {
            idempotency_key: self.idempotency_key.clone(),
            account_id: account.account_id.clone(),
            run_id: self.run_id.clone(),
            kind: self.op.kind(),
            amount_cents: amount,
            status: EntryStatus::Applied,
            balance_after_cents: account.balance_cents,
            reserved_after_cents: account.reserved_cents,
            recorded_at: now,
        };
        Ok(Applied {
            account,
            run_reserved_cents: run_reserved,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(op: LedgerOp) -> LedgerRequest {
        LedgerRequest {
            idempotency_key: "k".into(),
            account_id: "acct".into(),
            run_id: Some("run".into()),
            op,
        }
    }

    fn funded(balance: i64, reserved: i64) -> Option<AccountState> {
        Some(AccountState {
            account_id: "acct".into(),
            balance_cents: balance,
            reserved_cents: reserved,
        })
    }

    #[test]
    fn test_hold_checks_available_balance() {
        let err = request(LedgerOp::Hold { amount_cents: 700 })
            .apply_to(funded(1000, 400), 0, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                available_cents: 600,
                ..
            }
        ));
    }

    #[test]
    fn test_settle_floors_reserved_at_zero() {
        let applied = request(LedgerOp::Settle { amount_cents: 500 })
            .apply_to(funded(1000, 300), 300, Utc::now())
            .unwrap();
        assert_eq!(applied.account.reserved_cents, 0);
        assert_eq!(applied.account.balance_cents, 1000);
        assert_eq!(applied.run_reserved_cents, 0);
    }

    #[test]
    fn test_refund_run_uses_run_reservation() {
        let applied = request(LedgerOp::RefundRun)
            .apply_to(funded(1000, 500), 200, Utc::now())
            .unwrap();
        assert_eq!(applied.entry.amount_cents, 200);
        assert_eq!(applied.account.reserved_cents, 300);
        assert_eq!(applied.account.balance_cents, 1200);
        assert_eq!(applied.entry.kind, LedgerKind::Refund);
    }

    #[test]
    fn test_topup_creates_account() {
        let applied = request(LedgerOp::Topup { amount_cents: 50 })
            .apply_to(None, 0, Utc::now())
            .unwrap();
        assert_eq!(applied.account.balance_cents, 50);
    }

    #[test]
    fn test_negative_amount_rejected() {
        let err = request(LedgerOp::Hold { amount_cents: -1 })
            .apply_to(funded(10, 0), 0, Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(-1)));
    }
}
