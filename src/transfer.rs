//! Transfers between two accounts as a single atomic unit.

use crate::account::AccountId;
use crate::accounts::AccountStore;
use crate::balance::{completed, require_positive, BalanceLedger};
use crate::error::{LedgerError, LedgerResult, StoreError};
use crate::journal::TransactionLog;
use crate::money::Money;
use crate::store::SharedStore;
use crate::transaction::{NewEntry, OperationId, Transaction};

#[derive(Clone)]
pub struct TransferOrchestrator {
    accounts: AccountStore,
    log: TransactionLog,
    balances: BalanceLedger,
}

impl TransferOrchestrator {
    pub fn new(store: SharedStore) -> Self {
        TransferOrchestrator {
            accounts: AccountStore::new(store.clone()),
            log: TransactionLog::new(store.clone()),
            balances: BalanceLedger::new(store),
        }
    }

    /// Moves `amount` from `from` to `to`.
    ///
    /// Returns the new balances of `from` and `to`. Both sides are logged as
    /// `TRANSFER` entries naming each other as counterparty; they complete or
    /// fail together.
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Money,
    ) -> LedgerResult<(Money, Money)> {
        let (_, balances) = self.execute(from, to, amount, None).await?;
        Ok(balances)
    }

    /// Runs a transfer whose entries carry `operation`; returns the completed
    /// debit and credit entries along with the new balances.
    pub(crate) async fn execute(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Money,
        operation: Option<OperationId>,
    ) -> LedgerResult<(Vec<Transaction>, (Money, Money))> {
        let amount = require_positive(amount)?;
        if from == to {
            return Err(LedgerError::SameAccount(from));
        }

        let source = self.accounts.get(from).await?;
        let target = self.accounts.get(to).await?;
        if source.currency != target.currency {
            return Err(LedgerError::CurrencyMismatch {
                from: source.currency,
                to: target.currency,
            });
        }

        let pair = NewEntry::transfer_pair(from, to, amount)
            .map(|entry| entry.with_operation(operation.clone()));
        let entries = self.log.append(&pair).await?;
        match self.balances.settle(&entries).await?.as_slice() {
            &[from_balance, to_balance] => Ok((
                entries.into_iter().map(completed).collect(),
                (from_balance, to_balance),
            )),
            other => Err(StoreError::Backend(format!(
                "expected two balances for a transfer, got {}",
                other.len()
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Currency, OwnerId};
    use crate::store::{InMemoryStore, LedgerStore};
    use crate::transaction::{TxKind, TxStatus};
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    fn dec(s: &str) -> Money {
        Money::from_str(s).unwrap()
    }

    async fn open(store: &Arc<InMemoryStore>, currency: Currency, balance: &str) -> AccountId {
        let account = store.insert_account(OwnerId(1), currency).await.unwrap();
        if balance != "0" {
            BalanceLedger::new(store.clone())
                .deposit(account.id, dec(balance))
                .await
                .unwrap();
        }
        account.id
    }

    async fn balance_of(store: &InMemoryStore, id: AccountId) -> Money {
        store.fetch_account(id).await.unwrap().unwrap().balance
    }

    async fn transfer_entries(store: &InMemoryStore, id: AccountId) -> Vec<(Money, TxStatus, Option<AccountId>)> {
        store
            .entries_for_account(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == TxKind::Transfer)
            .map(|e| (e.amount, e.status, e.counterparty))
            .collect()
    }

    #[tokio::test]
    async fn test_transfer_moves_funds_and_logs_both_sides() {
        let store = Arc::new(InMemoryStore::new());
        let a = open(&store, Currency::Usd, "1000").await;
        let b = open(&store, Currency::Usd, "0").await;
        let transfers = TransferOrchestrator::new(store.clone());

        let (from_balance, to_balance) = transfers.transfer(a, b, dec("250.50")).await.unwrap();
        assert_eq!(from_balance, dec("749.50"));
        assert_eq!(to_balance, dec("250.50"));
        assert_eq!(balance_of(&store, a).await, dec("749.5"));
        assert_eq!(balance_of(&store, b).await, dec("250.5"));

        assert_eq!(
            transfer_entries(&store, a).await,
            vec![(dec("-250.50"), TxStatus::Completed, Some(b))]
        );
        assert_eq!(
            transfer_entries(&store, b).await,
            vec![(dec("250.50"), TxStatus::Completed, Some(a))]
        );
    }

    #[tokio::test]
    async fn test_insufficient_funds_changes_neither_balance() {
        let store = Arc::new(InMemoryStore::new());
        let a = open(&store, Currency::Usd, "100").await;
        let b = open(&store, Currency::Usd, "0").await;
        let transfers = TransferOrchestrator::new(store.clone());

        let err = transfers.transfer(a, b, dec("150")).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { account, .. } if account == a));
        assert_eq!(balance_of(&store, a).await, dec("100"));
        assert_eq!(balance_of(&store, b).await, Money::ZERO);
        assert_eq!(
            transfer_entries(&store, a).await,
            vec![(dec("-150"), TxStatus::Failed, Some(b))]
        );
        assert_eq!(
            transfer_entries(&store, b).await,
            vec![(dec("150"), TxStatus::Failed, Some(a))]
        );
    }

    #[tokio::test]
    async fn test_rejections_before_any_entry() {
        let store = Arc::new(InMemoryStore::new());
        let a = open(&store, Currency::Usd, "100").await;
        let eur = open(&store, Currency::Eur, "0").await;
        let transfers = TransferOrchestrator::new(store.clone());

        assert!(matches!(
            transfers.transfer(a, a, dec("10")).await,
            Err(LedgerError::SameAccount(id)) if id == a
        ));
        assert!(matches!(
            transfers.transfer(a, eur, dec("0")).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            transfers.transfer(a, AccountId(404), dec("1")).await,
            Err(LedgerError::AccountNotFound(AccountId(404)))
        ));
        assert!(matches!(
            transfers.transfer(a, eur, dec("1")).await,
            Err(LedgerError::CurrencyMismatch {
                from: Currency::Usd,
                to: Currency::Eur
            })
        ));
        assert!(transfer_entries(&store, a).await.is_empty());
        assert!(transfer_entries(&store, eur).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_both_balances() {
        let store = Arc::new(InMemoryStore::new());
        let a = open(&store, Currency::Rub, "300").await;
        let b = open(&store, Currency::Rub, "50").await;
        let transfers = TransferOrchestrator::new(store.clone());

        store.fail_next_commit(StoreError::Backend("write failed".to_string()));
        let err = transfers.transfer(a, b, dec("100")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert_eq!(balance_of(&store, a).await, dec("300"));
        assert_eq!(balance_of(&store, b).await, dec("50"));
        assert_eq!(transfer_entries(&store, a).await[0].1, TxStatus::Failed);
        assert_eq!(transfer_entries(&store, b).await[0].1, TxStatus::Failed);
    }

    #[tokio::test]
    async fn test_lock_timeout_fails_cleanly_and_is_retryable() {
        let store = Arc::new(InMemoryStore::with_lock_timeout(Duration::from_millis(50)));
        let a = open(&store, Currency::Usd, "100").await;
        let b = open(&store, Currency::Usd, "0").await;
        let transfers = TransferOrchestrator::new(store.clone());

        let mut holder = store.begin().await.unwrap();
        holder.lock_accounts(&[b]).await.unwrap();

        let err = transfers.transfer(a, b, dec("10")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transfer_entries(&store, a).await[0].1, TxStatus::Failed);

        holder.rollback().await.unwrap();
        let (from_balance, to_balance) = transfers.transfer(a, b, dec("10")).await.unwrap();
        assert_eq!((from_balance, to_balance), (dec("90"), dec("10")));
    }
}
