//! The ledger facade: one entry point over accounts, balances, transfers and the log.

use crate::account::{Account, AccountId, Currency, OwnerId};
use crate::accounts::AccountStore;
use crate::balance::{adjustment, require_positive, BalanceLedger};
use crate::config::{Backend, Config};
use crate::error::{LedgerError, LedgerResult, StoreError};
use crate::journal::TransactionLog;
use crate::money::Money;
use crate::store::{InMemoryStore, PostgresStore, SharedStore};
use crate::transaction::{OperationId, Transaction};
use crate::transfer::TransferOrchestrator;
use chrono::Utc;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of an external card authorization, attached to a card debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardAuthorization {
    pub authorized: bool,
    pub amount: Money,
}

/// Ledger operations over one store.
///
/// Cloning is cheap; clones share the store and may be used from many tasks.
#[derive(Clone)]
pub struct Ledger {
    accounts: AccountStore,
    log: TransactionLog,
    balances: BalanceLedger,
    transfers: TransferOrchestrator,
}

impl Ledger {
    pub fn new(store: SharedStore) -> Self {
        Ledger {
            accounts: AccountStore::new(store.clone()),
            log: TransactionLog::new(store.clone()),
            balances: BalanceLedger::new(store.clone()),
            transfers: TransferOrchestrator::new(store),
        }
    }

    /// A ledger over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// Builds the ledger over the configured backend.
    ///
    /// The Postgres backend connects, then creates its tables if needed.
    pub async fn from_config(config: &Config) -> LedgerResult<Self> {
        let store: SharedStore = match config.backend {
            Backend::Memory => {
                info!("Using in-memory ledger store");
                Arc::new(InMemoryStore::with_lock_timeout(config.lock_timeout))
            }
            Backend::Postgres => {
                let store = PostgresStore::connect(&config.database, config.lock_timeout).await?;
                store.migrate().await?;
                Arc::new(store)
            }
        };
        Ok(Self::new(store))
    }

    pub async fn create_account(&self, owner: OwnerId, currency: Currency) -> LedgerResult<Account> {
        self.accounts.create(owner, currency).await
    }

    pub async fn get_account(&self, id: AccountId) -> LedgerResult<Account> {
        self.accounts.get(id).await
    }

    pub async fn list_accounts(&self, owner: OwnerId) -> LedgerResult<Vec<Account>> {
        self.accounts.list_by_owner(owner).await
    }

    /// Applies a signed balance change; returns the new balance.
    pub async fn adjust_balance(&self, id: AccountId, delta: Money) -> LedgerResult<Money> {
        self.balances.adjust(id, delta).await
    }

    pub async fn deposit(&self, id: AccountId, amount: Money) -> LedgerResult<Money> {
        self.balances.deposit(id, amount).await
    }

    pub async fn withdraw(&self, id: AccountId, amount: Money) -> LedgerResult<Money> {
        self.balances.withdraw(id, amount).await
    }

    /// Moves funds between two accounts; returns the new balances of both.
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Money,
    ) -> LedgerResult<(Money, Money)> {
        self.transfers.transfer(from, to, amount).await
    }

    /// Applies a signed balance change at most once per `operation`.
    ///
    /// Returns the entry written for the key. A repeated key returns the entries
    /// recorded by the first call, whatever their status, and changes nothing; a
    /// `PENDING` entry there means the first call's outcome is still unknown.
    pub async fn adjust_balance_once(
        &self,
        operation: OperationId,
        id: AccountId,
        delta: Money,
    ) -> LedgerResult<Vec<Transaction>> {
        if let Some(recorded) = self.recorded(&operation).await? {
            return Ok(recorded);
        }
        let entry = adjustment(id, delta)?.with_operation(Some(operation.clone()));
        match self.balances.apply(entry).await {
            Ok((entry, _)) => Ok(vec![entry]),
            Err(err) => self.recorded_or(&operation, err).await,
        }
    }

    /// Transfers at most once per `operation`; see [`Ledger::adjust_balance_once`].
    ///
    /// Returns the debit and credit entries.
    pub async fn transfer_once(
        &self,
        operation: OperationId,
        from: AccountId,
        to: AccountId,
        amount: Money,
    ) -> LedgerResult<Vec<Transaction>> {
        if let Some(recorded) = self.recorded(&operation).await? {
            return Ok(recorded);
        }
        match self
            .transfers
            .execute(from, to, amount, Some(operation.clone()))
            .await
        {
            Ok((entries, _)) => Ok(entries),
            Err(err) => self.recorded_or(&operation, err).await,
        }
    }

    async fn recorded(&self, operation: &OperationId) -> LedgerResult<Option<Vec<Transaction>>> {
        let entries = self.log.for_operation(operation).await?;
        if entries.is_empty() {
            return Ok(None);
        }
        info!("Operation {} already recorded, returning its entries", operation);
        Ok(Some(entries))
    }

    /// A concurrent call with the same key loses the uniqueness check on append;
    /// it reports the winner's entries instead of the constraint error.
    async fn recorded_or(
        &self,
        operation: &OperationId,
        err: LedgerError,
    ) -> LedgerResult<Vec<Transaction>> {
        if let LedgerError::Persistence(StoreError::Constraint(_)) = err {
            if let Some(recorded) = self.recorded(operation).await? {
                return Ok(recorded);
            }
        }
        Err(err)
    }

    /// Log entries of an existing account in creation order.
    pub async fn list_transactions(&self, id: AccountId) -> LedgerResult<Vec<Transaction>> {
        self.accounts.get(id).await?;
        self.log.list(id).await
    }

    /// Withdraws for a card payment once the card network has authorized it.
    ///
    /// An unauthorized payment is rejected before anything is recorded.
    pub async fn card_debit(
        &self,
        id: AccountId,
        authorization: CardAuthorization,
    ) -> LedgerResult<Money> {
        let amount = require_positive(authorization.amount)?;
        if !authorization.authorized {
            debug!("Card payment of {} on account {} was declined", amount, id);
            return Err(LedgerError::PaymentNotAuthorized);
        }
        self.balances.withdraw(id, amount).await
    }

    /// Marks `PENDING` entries older than `older_than` as `FAILED`.
    ///
    /// Returns how many entries were failed.
    pub async fn fail_stale_pending(&self, older_than: Duration) -> LedgerResult<usize> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };
        Ok(self.log.fail_pending_before(cutoff).await?.len())
    }

    /// The transaction log, for reading and finalizing single entries.
    pub fn transactions(&self) -> &TransactionLog {
        &self.log
    }
}
