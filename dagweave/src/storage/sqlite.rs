use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{AttemptRecord, PersistencePort, StoreError, StoreResult};
use crate::ledger::{
    AccountState, EntryStatus, LedgerEntry, LedgerError, LedgerKind, LedgerOutcome,
    LedgerRequest, RunReservation,
};
use crate::recipes::{MappingRecipe, RecipeOrigin};
use crate::types::{ExecutionLog, ExecutionStatus, Run, TransformAttempt};

/// DDL for every table the orchestrator needs. Idempotent.
///
/// `ledger_entries` is UNIQUE on `(idempotency_key, kind)` so that a replayed
/// mutation can never be inserted twice, even by a second process sharing the
/// file. A hold and a settle may share a caller key.
const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id       TEXT PRIMARY KEY,
    chain_id     TEXT NOT NULL,
    status       TEXT NOT NULL,
    started_at   TEXT,
    finished_at  TEXT,
    data         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS transform_attempts (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id              TEXT    NOT NULL,
    node_id             TEXT    NOT NULL,
    method              TEXT    NOT NULL,
    compatibility_score REAL    NOT NULL,
    accepted            INTEGER NOT NULL,
    data                TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attempts_run ON transform_attempts(run_id);
CREATE TABLE IF NOT EXISTS execution_logs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key  TEXT    NOT NULL,
    run_id           TEXT    NOT NULL,
    node_id          TEXT    NOT NULL,
    status           TEXT    NOT NULL,
    duration_ms      INTEGER NOT NULL,
    recorded_at      TEXT    NOT NULL,
    data             TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exec_key ON execution_logs(idempotency_key);
CREATE TABLE IF NOT EXISTS mapping_recipes (
    id                  TEXT PRIMARY KEY,
    source_fingerprint  TEXT    NOT NULL,
    target_fingerprint  TEXT    NOT NULL,
    origin              TEXT    NOT NULL,
    ops                 TEXT    NOT NULL,
    success_count       INTEGER NOT NULL DEFAULT 0,
    fail_count          INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_recipes_shape ON mapping_recipes(source_fingerprint, target_fingerprint);
CREATE TABLE IF NOT EXISTS ledger_accounts (
    account_id      TEXT PRIMARY KEY,
    balance_cents   INTEGER NOT NULL,
    reserved_cents  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS ledger_entries (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key      TEXT    NOT NULL,
    account_id           TEXT    NOT NULL,
    run_id               TEXT,
    kind                 TEXT    NOT NULL,
    amount_cents         INTEGER NOT NULL,
    status               TEXT    NOT NULL,
    balance_after_cents  INTEGER NOT NULL,
    reserved_after_cents INTEGER NOT NULL,
    recorded_at          TEXT    NOT NULL,
    UNIQUE (idempotency_key, kind)
);
CREATE TABLE IF NOT EXISTS run_reservations (
    run_id          TEXT PRIMARY KEY,
    account_id      TEXT    NOT NULL,
    reserved_cents  INTEGER NOT NULL
);
";

/// `rusqlite::Connection` is `Send` but not `Sync`; the mutex makes the store
/// shareable and doubles as the serializing primitive for ledger updates.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SqliteStore(<sqlite>)")
    }
}

impl SqliteStore {
    /// Opens (or creates) a database file and initialises the schema.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL mode for better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        log::info!("[Store] Opened SQLite store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(CREATE_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_ts(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Invalid(format!("bad timestamp '{}': {}", value, e)))
}

fn status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Succeeded => "succeeded",
        ExecutionStatus::Failed => "failed",
    }
}

type RecipeRow = (String, String, String, String, String, i64, i64);

fn recipe_from_row(row: RecipeRow) -> StoreResult<MappingRecipe> {
    let (id, source_fingerprint, target_fingerprint, origin, ops, success, fail) = row;
    Ok(MappingRecipe {
        id,
        source_fingerprint,
        target_fingerprint,
        ops: serde_json::from_str(&ops)?,
        success_count: success.max(0) as u64,
        fail_count: fail.max(0) as u64,
        origin: RecipeOrigin::parse(&origin),
    })
}

fn read_recipe_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecipeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

const RECIPE_COLUMNS: &str =
    "id, source_fingerprint, target_fingerprint, origin, ops, success_count, fail_count";

type EntryRow = (String, String, Option<String>, String, i64, i64, i64, String);

fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn entry_from_row(row: EntryRow) -> StoreResult<LedgerEntry> {
    let (key, account_id, run_id, kind, amount, balance_after, reserved_after, recorded_at) = row;
    Ok(LedgerEntry {
        idempotency_key: key,
        account_id,
        run_id,
        kind: LedgerKind::parse(&kind)
            .ok_or_else(|| StoreError::Invalid(format!("unknown ledger kind '{}'", kind)))?,
        amount_cents: amount,
        status: EntryStatus::Applied,
        balance_after_cents: balance_after,
        reserved_after_cents: reserved_after,
        recorded_at: parse_ts(&recorded_at)?,
    })
}

const ENTRY_COLUMNS: &str = "idempotency_key, account_id, run_id, kind, amount_cents, \
     balance_after_cents, reserved_after_cents, recorded_at";

fn select_entry(
    conn: &Connection,
    key: &str,
    kind: LedgerKind,
) -> StoreResult<Option<LedgerEntry>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM ledger_entries WHERE idempotency_key = ?1 AND kind = ?2",
                ENTRY_COLUMNS
            ),
            params![key, kind.as_str()],
            read_entry_row,
        )
        .optional()?;
    row.map(entry_from_row).transpose()
}

fn select_account(conn: &Connection, account_id: &str) -> StoreResult<Option<AccountState>> {
    Ok(conn
        .query_row(
            "SELECT account_id, balance_cents, reserved_cents FROM ledger_accounts WHERE account_id = ?1",
            [account_id],
            |row| {
                Ok(AccountState {
                    account_id: row.get(0)?,
                    balance_cents: row.get(1)?,
                    reserved_cents: row.get(2)?,
                })
            },
        )
        .optional()?)
}

fn select_reservation(conn: &Connection, run_id: &str) -> StoreResult<Option<RunReservation>> {
    Ok(conn
        .query_row(
            "SELECT run_id, account_id, reserved_cents FROM run_reservations WHERE run_id = ?1",
            [run_id],
            |row| {
                Ok(RunReservation {
                    run_id: row.get(0)?,
                    account_id: row.get(1)?,
                    reserved_cents: row.get(2)?,
                })
            },
        )
        .optional()?)
}

#[async_trait]
impl PersistencePort for SqliteStore {
    async fn upsert_run(&self, run: &Run) -> StoreResult<()> {
        let data = serde_json::to_string(run)?;
        self.lock()?.execute(
            "INSERT INTO runs (run_id, chain_id, status, started_at, finished_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                data = excluded.data",
            params![
                run.run_id,
                run.chain_id,
                run.status.as_str(),
                run.started_at.as_ref().map(ts),
                run.finished_at.as_ref().map(ts),
                data
            ],
        )?;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> StoreResult<Option<Run>> {
        let data: Option<String> = self
            .lock()?
            .query_row("SELECT data FROM runs WHERE run_id = ?1", [run_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    async fn append_attempt(&self, record: &AttemptRecord) -> StoreResult<()> {
        let data = serde_json::to_string(&record.attempt)?;
        self.lock()?.execute(
            "INSERT INTO transform_attempts (run_id, node_id, method, compatibility_score, accepted, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.run_id,
                record.node_id,
                record.attempt.method.label(),
                record.attempt.compatibility_score,
                record.attempt.accepted,
                data
            ],
        )?;
        Ok(())
    }

    async fn attempts_for_run(&self, run_id: &str) -> StoreResult<Vec<AttemptRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, node_id, data FROM transform_attempts WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        rows.into_iter()
            .map(|(run_id, node_id, data)| {
                let attempt: TransformAttempt = serde_json::from_str(&data)?;
                Ok(AttemptRecord {
                    run_id,
                    node_id,
                    attempt,
                })
            })
            .collect()
    }

    async fn append_execution_log(&self, log: &ExecutionLog) -> StoreResult<()> {
        let data = serde_json::to_string(log)?;
        self.lock()?.execute(
            "INSERT INTO execution_logs (idempotency_key, run_id, node_id, status, duration_ms, recorded_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.idempotency_key,
                log.run_id,
                log.node_id,
                status_str(log.status),
                log.duration_ms as i64,
                ts(&log.recorded_at),
                data
            ],
        )?;
        Ok(())
    }

    async fn find_execution(&self, idempotency_key: &str) -> StoreResult<Option<ExecutionLog>> {
        let data: Option<String> = self
            .lock()?
            .query_row(
                "SELECT data FROM execution_logs
                 WHERE idempotency_key = ?1 AND status = 'succeeded'
                 ORDER BY id ASC LIMIT 1",
                [idempotency_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    async fn recipes_for(
        &self,
        source_fingerprint: &str,
        target_fingerprint: &str,
    ) -> StoreResult<Vec<MappingRecipe>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM mapping_recipes WHERE source_fingerprint = ?1 AND target_fingerprint = ?2",
            RECIPE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([source_fingerprint, target_fingerprint], read_recipe_row)
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        rows.into_iter().map(recipe_from_row).collect()
    }

    async fn get_recipe(&self, recipe_id: &str) -> StoreResult<Option<MappingRecipe>> {
        let row = self
            .lock()?
            .query_row(
                &format!("SELECT {} FROM mapping_recipes WHERE id = ?1", RECIPE_COLUMNS),
                [recipe_id],
                read_recipe_row,
            )
            .optional()?;
        row.map(recipe_from_row).transpose()
    }

    async fn record_recipe_outcome(
        &self,
        recipe: &MappingRecipe,
        success: bool,
    ) -> StoreResult<MappingRecipe> {
        let ops = serde_json::to_string(&recipe.ops)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO mapping_recipes (id, source_fingerprint, target_fingerprint, origin, ops, success_count, fail_count)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0)
             ON CONFLICT(id) DO NOTHING",
            params![
                recipe.id,
                recipe.source_fingerprint,
                recipe.target_fingerprint,
                recipe.origin.as_str(),
                ops
            ],
        )?;
        let bump = if success {
            "UPDATE mapping_recipes SET success_count = success_count + 1 WHERE id = ?1"
        } else {
            "UPDATE mapping_recipes SET fail_count = fail_count + 1 WHERE id = ?1"
        };
        tx.execute(bump, [&recipe.id])?;
        let row = tx.query_row(
            &format!("SELECT {} FROM mapping_recipes WHERE id = ?1", RECIPE_COLUMNS),
            [&recipe.id],
            read_recipe_row,
        )?;
        tx.commit()?;
        recipe_from_row(row)
    }

    async fn ledger_account(&self, account_id: &str) -> StoreResult<Option<AccountState>> {
        select_account(&*self.lock()?, account_id)
    }

    async fn ledger_entry(
        &self,
        idempotency_key: &str,
        kind: LedgerKind,
    ) -> StoreResult<Option<LedgerEntry>> {
        select_entry(&*self.lock()?, idempotency_key, kind)
    }

    async fn run_reservation(&self, run_id: &str) -> StoreResult<Option<RunReservation>> {
        select_reservation(&*self.lock()?, run_id)
    }

    async fn apply_ledger(&self, request: &LedgerRequest) -> Result<LedgerOutcome, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let kind = request.op.kind();
        if let Some(existing) = select_entry(&tx, &request.idempotency_key, kind)? {
            return Ok(LedgerOutcome {
                entry: existing,
                replayed: true,
            });
        }

        let account = select_account(&tx, &request.account_id)?;
        let reservation = match &request.run_id {
            Some(run_id) => select_reservation(&tx, run_id)?,
            None => None,
        };
        let run_reserved = reservation.as_ref().map(|r| r.reserved_cents).unwrap_or(0);

        // Dropping `tx` on error rolls back
        let applied = request.apply_to(account, run_reserved, Utc::now())?;

        tx.execute(
            "INSERT INTO ledger_accounts (account_id, balance_cents, reserved_cents)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id) DO UPDATE SET
                balance_cents = excluded.balance_cents,
                reserved_cents = excluded.reserved_cents",
            params![
                applied.account.account_id,
                applied.account.balance_cents,
                applied.account.reserved_cents
            ],
        )
        .map_err(StoreError::from)?;

        if let Some(run_id) = &request.run_id {
            let account_id = reservation
                .map(|r| r.account_id)
                .unwrap_or_else(|| request.account_id.clone());
            tx.execute(
                "INSERT INTO run_reservations (run_id, account_id, reserved_cents)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id) DO UPDATE SET reserved_cents = excluded.reserved_cents",
                params![run_id, account_id, applied.run_reserved_cents],
            )
            .map_err(StoreError::from)?;
        }

        let entry = &applied.entry;
        let inserted = tx.execute(
            "INSERT INTO ledger_entries (idempotency_key, account_id, run_id, kind, amount_cents, status,
                                         balance_after_cents, reserved_after_cents, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'applied', ?6, ?7, ?8)
             ON CONFLICT(idempotency_key, kind) DO NOTHING",
            params![
                entry.idempotency_key,
                entry.account_id,
                entry.run_id,
                entry.kind.as_str(),
                entry.amount_cents,
                entry.balance_after_cents,
                entry.reserved_after_cents,
                ts(&entry.recorded_at)
            ],
        )
        .map_err(StoreError::from)?;

        if inserted == 0 {
            // Another writer got there first; discard our state change
            drop(tx);
            let existing = select_entry(&conn, &request.idempotency_key, kind)?.ok_or_else(|| {
                StoreError::Invalid(format!(
                    "ledger key {} conflicted but no entry exists",
                    request.idempotency_key
                ))
            })?;
            return Ok(LedgerOutcome {
                entry: existing,
                replayed: true,
            });
        }

        tx.commit().map_err(StoreError::from)?;
        Ok(LedgerOutcome {
            entry: applied.entry,
            replayed: false,
        })
    }
}
