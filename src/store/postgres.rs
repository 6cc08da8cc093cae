//! Postgres-backed ledger store.
//!
//! Accounts and log entries live in the `accounts` and `transactions` tables
//! (`migrations/0001_ledger.sql`). A [`UnitOfWork`] is one SQL transaction:
//! rows are locked with `SELECT ... FOR UPDATE`, one id at a time in the order
//! given, under `SET LOCAL lock_timeout`.
//!
//! Appending entries takes `FOR KEY SHARE` on every referenced account, ascending,
//! before inserting. The foreign-key checks on `account_id` and `counterparty_id`
//! would otherwise take the same locks in insert order, which for a transfer
//! against the id order waits on a unit that already holds the lower row.
//!
//! ## Error Mapping
//!
//! | SQLSTATE | Meaning | StoreError |
//! |----------|---------|------------|
//! | `55P03` | lock_not_available | `LockTimeout` |
//! | `40P01` | deadlock_detected | `Deadlock` |
//! | `40001` | serialization_failure | `Conflict` |
//! | `23xxx` | integrity constraint violation | `Constraint` |
//! | other | | `Database` |
//!
//! A connection-level failure while `COMMIT` is in flight maps to
//! `CommitUnacknowledged`: the server may or may not have committed.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Connection, Postgres, Row};

use super::{LedgerStore, UnitOfWork};
use crate::account::{Account, AccountId, Currency, OwnerId};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::money::Money;
use crate::transaction::{NewEntry, OperationId, Transaction, TransactionId, TxStatus};

const SCHEMA: &str = include_str!("../../migrations/0001_ledger.sql");

const ACCOUNT_COLUMNS: &str = "id, user_id, balance, currency, created_at";
const ENTRY_COLUMNS: &str =
    "id, account_id, amount, type, status, counterparty_id, operation_id, created_at";

/// Ledger store over a shared Postgres connection pool.
///
/// `Clone` is cheap; clones share the pool. Every serving instance pointing at the
/// same database shares the same row locks.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        PostgresStore { pool, lock_timeout }
    }

    /// Opens a pool with the configured limits and checks the connection.
    pub async fn connect(
        config: &DatabaseConfig,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.idle_timeout)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        conn.ping().await.map_err(|e| map_sqlx_error("ping", e))?;
        drop(conn);

        info!(
            "Connected to Postgres (max {} connections)",
            config.max_connections
        );
        Ok(Self::new(pool, lock_timeout))
    }

    /// Creates the ledger tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn insert_account(
        &self,
        owner: OwnerId,
        currency: Currency,
    ) -> Result<Account, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (user_id, currency) VALUES ($1, $2) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(owner.0)
        .bind(currency.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_account", e))?;

        account_from_row(&row)
    }

    async fn fetch_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_account", e))?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn accounts_by_owner(&self, owner: OwnerId) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = $1 ORDER BY id"
        ))
        .bind(owner.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("accounts_by_owner", e))?;

        rows.iter().map(account_from_row).collect()
    }

    async fn append_entries(&self, entries: &[NewEntry]) -> Result<Vec<Transaction>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let referenced: Vec<i64> = entries
            .iter()
            .flat_map(|e| std::iter::once(e.account_id).chain(e.counterparty))
            .map(|id| id.0)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        sqlx::query("SELECT id FROM accounts WHERE id = ANY($1) ORDER BY id FOR KEY SHARE")
            .bind(referenced.as_slice())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_referenced_accounts", e))?;

        let insert = format!(
            "INSERT INTO transactions (account_id, amount, type, counterparty_id, operation_id) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {ENTRY_COLUMNS}"
        );
        let mut appended = Vec::with_capacity(entries.len());
        for entry in entries {
            let row = sqlx::query(&insert)
                .bind(entry.account_id.0)
                .bind(entry.amount.as_decimal())
                .bind(entry.kind.as_str())
                .bind(entry.counterparty.map(|id| id.0))
                .bind(entry.operation.as_ref().map(|op| op.0.as_str()))
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("append_entry", e))?;
            appended.push(entry_from_row(&row)?);
        }

        tx.commit()
            .await
            .map_err(|e| map_commit_error("append_entries", e))?;
        Ok(appended)
    }

    async fn fetch_entry(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_entry", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn entries_for_account(&self, id: AccountId) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM transactions WHERE account_id = $1 ORDER BY id"
        ))
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries_for_account", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn entries_for_operation(
        &self,
        operation: &OperationId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM transactions WHERE operation_id = $1 ORDER BY id"
        ))
        .bind(operation.0.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries_for_operation", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn pending_entries_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM transactions \
             WHERE status = 'PENDING' AND created_at < $1 ORDER BY id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_entries_before", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn finalize_entry(
        &self,
        id: TransactionId,
        status: TxStatus,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE transactions SET status = $2 \
             WHERE id = $1 AND status = 'PENDING' RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(id.0)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("finalize_entry", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // SET does not take bind parameters; the value is an integer we format.
        let millis = self.lock_timeout.as_millis().max(1);
        let set_timeout = format!("SET LOCAL lock_timeout = '{millis}ms'");
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(Box::new(PgUnit {
            tx,
            locked: Vec::new(),
        }))
    }
}

/// One SQL transaction holding `FOR UPDATE` row locks.
struct PgUnit {
    tx: sqlx::Transaction<'static, Postgres>,
    locked: Vec<AccountId>,
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        let select = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE");
        let mut accounts = Vec::with_capacity(ids.len());
        for &id in ids {
            let row = sqlx::query(&select)
                .bind(id.0)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| {
                    if sqlstate(&e).as_deref() == Some("55P03") {
                        StoreError::LockTimeout(id)
                    } else {
                        map_sqlx_error("lock_account", e)
                    }
                })?;

            if let Some(row) = row {
                accounts.push(account_from_row(&row)?);
                if !self.locked.contains(&id) {
                    self.locked.push(id);
                }
            }
        }
        Ok(accounts)
    }

    async fn set_balance(&mut self, id: AccountId, balance: Money) -> Result<(), StoreError> {
        if !self.locked.contains(&id) {
            return Err(StoreError::Backend(format!(
                "balance of account {id} written without holding its row lock"
            )));
        }
        sqlx::query("UPDATE accounts SET balance = $2 WHERE id = $1")
            .bind(id.0)
            .bind(balance.as_decimal())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("set_balance", e))?;
        Ok(())
    }

    async fn finalize_entry(
        &mut self,
        id: TransactionId,
        status: TxStatus,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE transactions SET status = $2 WHERE id = $1 AND status = 'PENDING'")
                .bind(id.0)
                .bind(status.as_str())
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("finalize_entry", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_commit_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let balance: Decimal = row.try_get("balance")?;
    let currency: String = row.try_get("currency")?;
    Ok(Account {
        id: AccountId(row.try_get("id")?),
        owner: OwnerId(row.try_get("user_id")?),
        balance: Money::new(balance).map_err(|e| StoreError::Decode(e.to_string()))?,
        currency: currency.parse().map_err(StoreError::Decode)?,
        created_at: row.try_get("created_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let amount: Decimal = row.try_get("amount")?;
    let kind: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    let counterparty: Option<i64> = row.try_get("counterparty_id")?;
    let operation: Option<String> = row.try_get("operation_id")?;
    Ok(Transaction {
        id: TransactionId(row.try_get("id")?),
        account_id: AccountId(row.try_get("account_id")?),
        amount: Money::new(amount).map_err(|e| StoreError::Decode(e.to_string()))?,
        kind: kind.parse().map_err(StoreError::Decode)?,
        status: status.parse().map_err(StoreError::Decode)?,
        counterparty: counterparty.map(AccountId),
        operation: operation.map(OperationId),
        created_at: row.try_get("created_at")?,
    })
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    debug!("{} failed: {}", operation, err);
    match sqlstate(&err).as_deref() {
        Some("40P01") => StoreError::Deadlock,
        Some("40001") => StoreError::Conflict(format!("serialization failure in {operation}")),
        Some(code) if code.starts_with("23") => {
            StoreError::Constraint(format!("{operation}: {err}"))
        }
        _ => StoreError::Database(err),
    }
}

/// Like [`map_sqlx_error`], but a transport failure means the outcome is unknown.
fn map_commit_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            StoreError::CommitUnacknowledged(format!("{operation}: {err}"))
        }
        other => map_sqlx_error(operation, other),
    }
}
