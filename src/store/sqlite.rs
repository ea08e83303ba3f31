//! SQLite-backed [`CreditStore`].
//!
//! Several `SqliteStore` handles may open the same database file; each one
//! behaves like an independent client. Writes run inside `BEGIN IMMEDIATE`
//! transactions so the version check and the balance update are atomic across
//! handles, and WAL mode keeps readers from blocking on writers.

use super::model::{
    Account, AppendOutcome, Identity, IdentityId, Job, JobId, JobState, NewTransaction,
    PaymentRecord, PaymentStatus, Settlement, Subscription, Transaction, TransactionId,
};
use super::CreditStore;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

macro_rules! sql_string_id {
    ($($name:ty),*) => {
        $(
            impl ToSql for $name {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_str()))
                }
            }

            impl FromSql for $name {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    String::column_result(value).map(<$name>::new)
                }
            }
        )*
    };
}

sql_string_id!(IdentityId, TransactionId, JobId);

impl ToSql for JobState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Self::parse(raw).ok_or_else(|| FromSqlError::Other(format!("unknown job state: {raw}").into()))
    }
}

impl ToSql for PaymentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PaymentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Self::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown payment status: {raw}").into()))
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS identities (
        id          TEXT PRIMARY KEY,
        email       TEXT,
        created_at  INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS accounts (
        identity    TEXT PRIMARY KEY,
        balance     INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
        version     INTEGER NOT NULL DEFAULT 0,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS transactions (
        id               TEXT PRIMARY KEY,
        account          TEXT NOT NULL REFERENCES accounts(identity),
        amount           INTEGER NOT NULL,
        reason           TEXT NOT NULL,
        correlation_key  TEXT UNIQUE,
        reverses         TEXT UNIQUE REFERENCES transactions(id),
        created_at       INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account, created_at);

    CREATE TABLE IF NOT EXISTS jobs (
        id              TEXT PRIMARY KEY,
        identity        TEXT NOT NULL,
        tool_id         TEXT NOT NULL,
        state           TEXT NOT NULL,
        transaction_id  TEXT,
        failure_reason  TEXT,
        created_at      INTEGER NOT NULL,
        heartbeat_at    INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_state_heartbeat ON jobs(state, heartbeat_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_identity ON jobs(identity);

    CREATE TABLE IF NOT EXISTS payments (
        payment_id        TEXT PRIMARY KEY,
        claimed_identity  TEXT,
        identity          TEXT,
        plan_id           TEXT NOT NULL,
        amount            INTEGER NOT NULL,
        currency          TEXT NOT NULL,
        delivered_at      INTEGER NOT NULL,
        status            TEXT NOT NULL,
        transaction_id    TEXT,
        note              TEXT,
        recorded_at       INTEGER NOT NULL,
        updated_at        INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status);

    CREATE TABLE IF NOT EXISTS subscriptions (
        identity     TEXT PRIMARY KEY,
        plan_id      TEXT NOT NULL,
        valid_until  INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL
    );
";

const ACCOUNT_COLUMNS: &str = "identity, balance, version, created_at, updated_at";
const TX_COLUMNS: &str = "id, account, amount, reason, correlation_key, reverses, created_at";
const JOB_COLUMNS: &str = "j.id, j.identity, j.tool_id, j.state, j.transaction_id, \
                           j.failure_reason, j.created_at, j.heartbeat_at, j.updated_at";
const PAYMENT_COLUMNS: &str = "payment_id, claimed_identity, identity, plan_id, amount, currency, \
                               delivered_at, status, transaction_id, note, recorded_at";

/// Reaped jobs joined to their debit (linked, or found by correlation key)
/// where the debit has not been compensated yet.
const UNSETTLED_REAPED: &str = "
    FROM jobs j
    JOIN transactions d
      ON d.id = j.transaction_id OR d.correlation_key = 'job:' || j.id
    WHERE j.state = 'reaped'
      AND NOT EXISTS (SELECT 1 FROM transactions r WHERE r.reverses = d.id)";

/// A store handle over one SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn map_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        identity: row.get(0)?,
        balance: row.get(1)?,
        version: row.get(2)?,
        created_at: from_millis(row.get(3)?),
        updated_at: from_millis(row.get(4)?),
    })
}

fn map_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        account: row.get(1)?,
        amount: row.get(2)?,
        reason: row.get(3)?,
        correlation_key: row.get(4)?,
        reverses: row.get(5)?,
        created_at: from_millis(row.get(6)?),
    })
}

fn map_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        identity: row.get(1)?,
        tool_id: row.get(2)?,
        state: row.get(3)?,
        transaction_id: row.get(4)?,
        failure_reason: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        heartbeat_at: from_millis(row.get(7)?),
        updated_at: from_millis(row.get(8)?),
    })
}

fn map_payment(row: &Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let amount: i64 = row.get(4)?;
    Ok(PaymentRecord {
        payment_id: row.get(0)?,
        claimed_identity: row.get(1)?,
        identity: row.get(2)?,
        plan_id: row.get(3)?,
        amount: u64::try_from(amount).unwrap_or_default(),
        currency: row.get(5)?,
        delivered_at: from_millis(row.get(6)?),
        status: row.get(7)?,
        transaction_id: row.get(8)?,
        note: row.get(9)?,
        recorded_at: from_millis(row.get(10)?),
    })
}

fn map_subscription(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        identity: row.get(0)?,
        plan_id: row.get(1)?,
        valid_until: from_millis(row.get(2)?),
        updated_at: from_millis(row.get(3)?),
    })
}

fn load_account(conn: &Connection, id: &IdentityId) -> rusqlite::Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE identity = ?1"),
        params![id],
        map_account,
    )
    .optional()
}

fn load_transaction(
    conn: &Connection,
    clause: &str,
    value: &dyn ToSql,
) -> rusqlite::Result<Option<Transaction>> {
    conn.query_row(
        &format!("SELECT {TX_COLUMNS} FROM transactions WHERE {clause} = ?1"),
        params![value],
        map_transaction,
    )
    .optional()
}

fn load_identity(conn: &Connection, id: &IdentityId) -> rusqlite::Result<Option<Identity>> {
    conn.query_row(
        "SELECT id, email FROM identities WHERE id = ?1",
        params![id],
        |row| {
            Ok(Identity {
                id: row.get(0)?,
                email: row.get(1)?,
            })
        },
    )
    .optional()
}

fn load_subscription(conn: &Connection, id: &IdentityId) -> rusqlite::Result<Option<Subscription>> {
    conn.query_row(
        "SELECT identity, plan_id, valid_until, updated_at FROM subscriptions WHERE identity = ?1",
        params![id],
        map_subscription,
    )
    .optional()
}

fn append_in(
    conn: &mut Connection,
    account: &IdentityId,
    expected_version: i64,
    new: NewTransaction,
) -> Result<AppendOutcome, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(key) = new.correlation_key.as_deref() {
        if let Some(existing) = load_transaction(&tx, "correlation_key", &key)? {
            return Ok(AppendOutcome::DuplicateCorrelation(existing));
        }
    }
    if let Some(target) = new.reverses.as_ref() {
        if let Some(existing) = load_transaction(&tx, "reverses", target)? {
            return Ok(AppendOutcome::AlreadyReversed(existing));
        }
    }

    let now = Utc::now();
    let updated = tx.execute(
        "UPDATE accounts
            SET balance = balance + ?1, version = version + 1, updated_at = ?2
          WHERE identity = ?3 AND version = ?4 AND balance + ?1 >= 0",
        params![new.amount, to_millis(now), account, expected_version],
    )?;
    if updated == 0 {
        let current = load_account(&tx, account)?;
        return Ok(AppendOutcome::VersionConflict { current });
    }

    tx.execute(
        "INSERT INTO transactions (id, account, amount, reason, correlation_key, reverses, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new.id,
            account,
            new.amount,
            new.reason,
            new.correlation_key,
            new.reverses,
            to_millis(now),
        ],
    )?;

    let account_after = load_account(&tx, account)?
        .ok_or_else(|| StoreError::Corrupt(format!("account {account} vanished mid-append")))?;
    tx.commit()?;

    Ok(AppendOutcome::Appended {
        transaction: Transaction {
            id: new.id,
            account: account.clone(),
            amount: new.amount,
            reason: new.reason,
            correlation_key: new.correlation_key,
            reverses: new.reverses,
            created_at: from_millis(to_millis(now)),
        },
        account: account_after,
    })
}

fn settle_in(conn: &mut Connection, s: Settlement) -> Result<Option<Subscription>, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let updated = tx.execute(
        "UPDATE payments
            SET status = ?1, identity = ?2, transaction_id = ?3,
                note = COALESCE(?4, note), updated_at = ?5
          WHERE payment_id = ?6 AND status = ?7",
        params![
            s.to,
            s.identity,
            s.transaction_id,
            s.note,
            to_millis(s.now),
            s.payment_id,
            s.from,
        ],
    )?;
    if updated == 0 {
        return Ok(None);
    }

    // Time already paid for is kept; the new period starts when it runs out.
    let base = load_subscription(&tx, &s.identity)?
        .map(|sub| sub.valid_until.max(s.now))
        .unwrap_or(s.now);
    let valid_until = base
        .checked_add_months(Months::new(s.duration_months))
        .ok_or_else(|| StoreError::Corrupt(format!("subscription overflow for {}", s.identity)))?;

    tx.execute(
        "INSERT INTO subscriptions (identity, plan_id, valid_until, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(identity) DO UPDATE SET
             plan_id = excluded.plan_id,
             valid_until = excluded.valid_until,
             updated_at = excluded.updated_at",
        params![s.identity, s.plan_id, to_millis(valid_until), to_millis(s.now)],
    )?;
    tx.commit()?;

    Ok(Some(Subscription {
        identity: s.identity,
        plan_id: s.plan_id,
        valid_until: from_millis(to_millis(valid_until)),
        updated_at: from_millis(to_millis(s.now)),
    }))
}

#[async_trait]
impl CreditStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn upsert_identity(&self, identity: &Identity) -> Result<Identity, StoreError> {
        let identity = identity.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO identities (id, email, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET email = COALESCE(identities.email, excluded.email)",
                params![identity.id, identity.email, to_millis(Utc::now())],
            )?;
            load_identity(conn, &identity.id)?
                .ok_or_else(|| StoreError::Corrupt(format!("identity {} not stored", identity.id)))
        })
        .await
    }

    async fn identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
        let id = id.clone();
        self.run(move |conn| Ok(load_identity(conn, &id)?)).await
    }

    async fn account(&self, id: &IdentityId) -> Result<Option<Account>, StoreError> {
        let id = id.clone();
        self.run(move |conn| Ok(load_account(conn, &id)?)).await
    }

    async fn ensure_account(&self, id: &IdentityId) -> Result<Account, StoreError> {
        let id = id.clone();
        self.run(move |conn| {
            let now = to_millis(Utc::now());
            conn.execute(
                "INSERT OR IGNORE INTO accounts (identity, balance, version, created_at, updated_at)
                 VALUES (?1, 0, 0, ?2, ?2)",
                params![id, now],
            )?;
            load_account(conn, &id)?
                .ok_or_else(|| StoreError::Corrupt(format!("account {id} not created")))
        })
        .await
    }

    async fn append(
        &self,
        account: &IdentityId,
        expected_version: i64,
        tx: NewTransaction,
    ) -> Result<AppendOutcome, StoreError> {
        let account = account.clone();
        self.run(move |conn| append_in(conn, &account, expected_version, tx))
            .await
    }

    async fn transaction(&self, id: &TransactionId) -> Result<Option<Transaction>, StoreError> {
        let id = id.clone();
        self.run(move |conn| Ok(load_transaction(conn, "id", &id)?))
            .await
    }

    async fn transaction_by_key(&self, key: &str) -> Result<Option<Transaction>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| Ok(load_transaction(conn, "correlation_key", &key)?))
            .await
    }

    async fn reversal_of(&self, id: &TransactionId) -> Result<Option<Transaction>, StoreError> {
        let id = id.clone();
        self.run(move |conn| Ok(load_transaction(conn, "reverses", &id)?))
            .await
    }

    async fn transactions(
        &self,
        account: &IdentityId,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let account = account.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TX_COLUMNS} FROM transactions WHERE account = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![account, limit], map_transaction)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn transaction_sum(&self, account: &IdentityId) -> Result<i64, StoreError> {
        let account = account.clone();
        self.run(move |conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE account = ?1",
                params![account],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let job = job.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, identity, tool_id, state, transaction_id, failure_reason,
                                   created_at, heartbeat_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job.id,
                    job.identity,
                    job.tool_id,
                    job.state,
                    job.transaction_id,
                    job.failure_reason,
                    to_millis(job.created_at),
                    to_millis(job.heartbeat_at),
                    to_millis(job.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let id = id.clone();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE j.id = ?1"),
                    params![id],
                    map_job,
                )
                .optional()?)
        })
        .await
    }

    async fn attach_debit(&self, id: &JobId, tx: &TransactionId) -> Result<bool, StoreError> {
        let (id, tx) = (id.clone(), tx.clone());
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE jobs SET transaction_id = ?1, updated_at = ?2
                  WHERE id = ?3 AND state = 'pending' AND transaction_id IS NULL",
                params![tx, to_millis(Utc::now()), id],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn touch_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let id = id.clone();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE jobs SET heartbeat_at = ?1 WHERE id = ?2 AND state = 'pending'",
                params![to_millis(now), id],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn finish_job(
        &self,
        id: &JobId,
        state: JobState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = id.clone();
        let reason = reason.map(str::to_string);
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE jobs SET state = ?1, failure_reason = ?2, updated_at = ?3
                  WHERE id = ?4 AND state = 'pending'",
                params![state, reason, to_millis(now), id],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        scope: Option<&IdentityId>,
    ) -> Result<Vec<Job>, StoreError> {
        let scope = scope.cloned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs j
                  WHERE j.state = 'pending' AND j.heartbeat_at < ?1
                    AND (?2 IS NULL OR j.identity = ?2)
                  ORDER BY j.heartbeat_at"
            ))?;
            let rows = stmt
                .query_map(params![to_millis(cutoff), scope], map_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn unsettled_reaped_jobs(
        &self,
        scope: Option<&IdentityId>,
    ) -> Result<Vec<Job>, StoreError> {
        let scope = scope.cloned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT {JOB_COLUMNS} {UNSETTLED_REAPED}
                    AND (?1 IS NULL OR j.identity = ?1)
                  ORDER BY j.updated_at"
            ))?;
            let rows = stmt
                .query_map(params![scope], map_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn purge_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let deleted = conn.execute(
                &format!(
                    "DELETE FROM jobs
                      WHERE state != 'pending' AND updated_at < ?1
                        AND id NOT IN (SELECT j.id {UNSETTLED_REAPED})"
                ),
                params![to_millis(cutoff)],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn record_payment(&self, payment: &PaymentRecord) -> Result<bool, StoreError> {
        let p = payment.clone();
        self.run(move |conn| {
            let amount = i64::try_from(p.amount)
                .map_err(|_| StoreError::Corrupt(format!("payment amount too large: {}", p.amount)))?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO payments
                    (payment_id, claimed_identity, identity, plan_id, amount, currency,
                     delivered_at, status, transaction_id, note, recorded_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    p.payment_id,
                    p.claimed_identity,
                    p.identity,
                    p.plan_id,
                    amount,
                    p.currency,
                    to_millis(p.delivered_at),
                    p.status,
                    p.transaction_id,
                    p.note,
                    to_millis(p.recorded_at),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn payment(&self, payment_id: &str) -> Result<Option<PaymentRecord>, StoreError> {
        let payment_id = payment_id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = ?1"),
                    params![payment_id],
                    map_payment,
                )
                .optional()?)
        })
        .await
    }

    async fn payments_with_status(
        &self,
        status: PaymentStatus,
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments WHERE status = ?1 ORDER BY delivered_at"
            ))?;
            let rows = stmt
                .query_map(params![status], map_payment)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn settle_payment(
        &self,
        settlement: Settlement,
    ) -> Result<Option<Subscription>, StoreError> {
        self.run(move |conn| settle_in(conn, settlement)).await
    }

    async fn subscription(&self, id: &IdentityId) -> Result<Option<Subscription>, StoreError> {
        let id = id.clone();
        self.run(move |conn| Ok(load_subscription(conn, &id)?))
            .await
    }
}
