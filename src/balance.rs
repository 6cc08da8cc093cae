//! Balance mutations under row locks.
//!
//! Every mutation follows the same sequence:
//!
//! 1. validate the request without touching storage
//! 2. append one `PENDING` log entry per affected account
//! 3. open a unit, lock the affected rows in ascending id order, apply each
//!    entry's amount, mark the entries `COMPLETED` and commit
//! 4. on failure roll back and mark the entries `FAILED`
//!
//! A commit whose outcome is unknown leaves its entries `PENDING`; see
//! [`TransactionLog::fail_pending_before`].

use crate::account::{Account, AccountId};
use crate::accounts::AccountStore;
use crate::error::{LedgerError, LedgerResult, StoreError};
use crate::journal::TransactionLog;
use crate::money::Money;
use crate::store::{SharedStore, UnitOfWork};
use crate::transaction::{NewEntry, Transaction, TxKind, TxStatus};
use log::{debug, info, warn};
use std::collections::BTreeMap;

#[derive(Clone)]
pub struct BalanceLedger {
    store: SharedStore,
    accounts: AccountStore,
    log: TransactionLog,
}

impl BalanceLedger {
    pub fn new(store: SharedStore) -> Self {
        BalanceLedger {
            accounts: AccountStore::new(store.clone()),
            log: TransactionLog::new(store.clone()),
            store,
        }
    }

    /// Credits `amount` and returns the new balance.
    pub async fn deposit(&self, id: AccountId, amount: Money) -> LedgerResult<Money> {
        let amount = require_positive(amount)?;
        let (_, balance) = self.apply(NewEntry::deposit(id, amount)).await?;
        Ok(balance)
    }

    /// Debits `amount` and returns the new balance.
    ///
    /// Fails with `InsufficientFunds` if the balance is below `amount`.
    pub async fn withdraw(&self, id: AccountId, amount: Money) -> LedgerResult<Money> {
        let amount = require_positive(amount)?;
        let (_, balance) = self.apply(NewEntry::withdrawal(id, amount)).await?;
        Ok(balance)
    }

    /// Applies a signed change and returns the new balance.
    ///
    /// Positive deltas are logged as deposits, negative ones as withdrawals.
    pub async fn adjust(&self, id: AccountId, delta: Money) -> LedgerResult<Money> {
        let (_, balance) = self.apply(adjustment(id, delta)?).await?;
        Ok(balance)
    }

    /// Records `entry` and applies it; returns the completed entry and the new balance.
    pub(crate) async fn apply(&self, entry: NewEntry) -> LedgerResult<(Transaction, Money)> {
        self.accounts.get(entry.account_id).await?;

        let recorded = self.log.append(&[entry]).await?;
        let balances = self.settle(&recorded).await?;
        match (recorded.into_iter().next(), balances.last()) {
            (Some(entry), Some(&balance)) => Ok((completed(entry), balance)),
            _ => Err(StoreError::Backend("settlement returned no balance".to_string()).into()),
        }
    }

    /// Applies `PENDING` entries atomically and returns each account's balance
    /// after its entry, in entry order.
    ///
    /// On failure the entries are marked `FAILED` unless the commit outcome is
    /// unknown.
    pub(crate) async fn settle(&self, entries: &[Transaction]) -> LedgerResult<Vec<Money>> {
        let unit = self.store.begin().await?;
        match run_unit(unit, entries).await {
            Ok(balances) => {
                for entry in entries {
                    info!(
                        "Transaction {} completed: {} {} on account {}",
                        entry.id, entry.kind, entry.amount, entry.account_id
                    );
                }
                Ok(balances)
            }
            Err(err) => {
                let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
                if err.is_indeterminate() {
                    warn!(
                        "Outcome unknown for transaction(s) {:?}, leaving PENDING: {}",
                        ids, err
                    );
                } else {
                    if let LedgerError::Persistence(_) = err {
                        warn!("Transaction(s) {:?} failed: {}", ids, err);
                    } else {
                        debug!("Transaction(s) {:?} rejected: {}", ids, err);
                    }
                    self.log.fail_all(&ids).await;
                }
                Err(err)
            }
        }
    }
}

async fn run_unit(mut unit: Box<dyn UnitOfWork>, entries: &[Transaction]) -> LedgerResult<Vec<Money>> {
    match stage(unit.as_mut(), entries).await {
        Ok(balances) => {
            unit.commit().await?;
            Ok(balances)
        }
        Err(err) => {
            if let Err(e) = unit.rollback().await {
                warn!("Rollback failed: {}", e);
            }
            Err(err)
        }
    }
}

/// Locks the entries' accounts and stages their new balances and `COMPLETED` status.
async fn stage(unit: &mut dyn UnitOfWork, entries: &[Transaction]) -> LedgerResult<Vec<Money>> {
    let order = lock_order(entries);
    let mut locked: BTreeMap<AccountId, Account> = unit
        .lock_accounts(&order)
        .await?
        .into_iter()
        .map(|account| (account.id, account))
        .collect();
    debug!("Locked accounts {:?}", order);

    let mut balances = Vec::with_capacity(entries.len());
    for entry in entries {
        let account = locked
            .get_mut(&entry.account_id)
            .ok_or(LedgerError::AccountNotFound(entry.account_id))?;
        account.balance = account.applied(entry.amount)?;
        balances.push(account.balance);
    }

    for account in locked.values() {
        unit.set_balance(account.id, account.balance).await?;
    }
    for entry in entries {
        if !unit.finalize_entry(entry.id, TxStatus::Completed).await? {
            return Err(StoreError::Conflict(format!(
                "transaction {} is no longer PENDING",
                entry.id
            ))
            .into());
        }
    }
    Ok(balances)
}

/// Distinct account ids of `entries`, ascending.
///
/// Every unit locks in this order, so two units over the same accounts queue
/// instead of deadlocking.
pub(crate) fn lock_order(entries: &[Transaction]) -> Vec<AccountId> {
    let mut ids: Vec<AccountId> = entries.iter().map(|e| e.account_id).collect();
    ids.sort();
    ids.dedup();
    ids
}

/// The log entry for a signed balance change: a deposit if positive, a withdrawal
/// if negative.
pub(crate) fn adjustment(id: AccountId, delta: Money) -> LedgerResult<NewEntry> {
    if delta.is_zero() {
        return Err(LedgerError::InvalidAmount(
            "balance change must be non-zero".to_string(),
        ));
    }
    let kind = if delta.is_negative() {
        TxKind::Withdrawal
    } else {
        TxKind::Deposit
    };
    Ok(NewEntry {
        account_id: id,
        amount: delta,
        kind,
        counterparty: None,
        operation: None,
    })
}

/// `entry` as it reads after its unit committed.
pub(crate) fn completed(mut entry: Transaction) -> Transaction {
    entry.status = TxStatus::Completed;
    entry
}

pub(crate) fn require_positive(amount: Money) -> LedgerResult<Money> {
    if amount.is_positive() {
        Ok(amount)
    } else {
        Err(LedgerError::InvalidAmount(format!(
            "amount must be positive, got {amount}"
        )))
    }
}
