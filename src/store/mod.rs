//! Storage capability for the ledger.
//!
//! The ledger components never talk to a database directly. They receive a
//! [`LedgerStore`] at construction and open a [`UnitOfWork`] for every balance
//! mutation. A unit is the atomic boundary: row locks, balance writes and log
//! finalization inside it commit or abort together.
//!
//! ## Implementations
//!
//! - [`InMemoryStore`]: per-account async row locks, staged writes, used by tests
//!   and the default CLI run
//! - [`PostgresStore`]: `SELECT ... FOR UPDATE` row locks inside a SQL transaction
//!
//! ## Lock order
//!
//! `lock_accounts` locks rows in exactly the order it is given. Callers that lock
//! more than one row must pass ids in ascending order, which keeps two units
//! touching the same pair of accounts from waiting on each other.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

use crate::account::{Account, AccountId, Currency, OwnerId};
use crate::error::StoreError;
use crate::money::Money;
use crate::transaction::{NewEntry, OperationId, Transaction, TransactionId, TxStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Shared handle to whichever backend the process was configured with.
pub type SharedStore = Arc<dyn LedgerStore>;

/// Durable tables of accounts and transaction log entries.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts an account with a zero balance.
    async fn insert_account(
        &self,
        owner: OwnerId,
        currency: Currency,
    ) -> Result<Account, StoreError>;

    async fn fetch_account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Accounts of `owner`, ascending by id.
    async fn accounts_by_owner(&self, owner: OwnerId) -> Result<Vec<Account>, StoreError>;

    /// Appends entries in `PENDING` status, committed on their own.
    ///
    /// Either all entries are appended or none are. Returned in input order.
    /// Two entries with the same operation key on the same account violate a
    /// uniqueness constraint.
    async fn append_entries(&self, entries: &[NewEntry]) -> Result<Vec<Transaction>, StoreError>;

    async fn fetch_entry(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    /// Entries of one account in creation order.
    async fn entries_for_account(&self, id: AccountId) -> Result<Vec<Transaction>, StoreError>;

    /// Entries written under one operation key, in creation order.
    async fn entries_for_operation(
        &self,
        operation: &OperationId,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// `PENDING` entries created before `cutoff`, in creation order.
    async fn pending_entries_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Moves an entry from `PENDING` to `status` outside of any unit.
    ///
    /// Returns the updated entry, or `None` if the entry was not `PENDING`
    /// (or does not exist).
    async fn finalize_entry(
        &self,
        id: TransactionId,
        status: TxStatus,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Opens an atomic unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;
}

/// One atomic boundary over account rows and log entries.
///
/// Nothing written through a unit is visible to other callers until `commit`
/// returns `Ok`. Dropping a unit without committing discards its writes.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Locks the given rows for the rest of the unit and returns the ones that exist.
    ///
    /// Waits at most the store's lock timeout per row, then fails with
    /// [`StoreError::LockTimeout`].
    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError>;

    /// Stages a new balance for a row previously locked by this unit.
    async fn set_balance(&mut self, id: AccountId, balance: Money) -> Result<(), StoreError>;

    /// Stages the `PENDING` → `status` move of an entry.
    ///
    /// Returns `false` if the entry is no longer `PENDING`.
    async fn finalize_entry(
        &mut self,
        id: TransactionId,
        status: TxStatus,
    ) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
