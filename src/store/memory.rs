use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use super::{LedgerStore, UnitOfWork};
use crate::account::{Account, AccountId, Currency, OwnerId};
use crate::error::StoreError;
use crate::money::Money;
use crate::transaction::{NewEntry, OperationId, Transaction, TransactionId, TxStatus};

/// Default bounded wait for a row lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<TransactionId, Transaction>,
    /// Retry keys already used, per account.
    operations: HashSet<(OperationId, AccountId)>,
    last_account_id: i64,
    last_entry_id: i64,
}

#[derive(Debug)]
struct Shared {
    /// Committed state. A unit applies all of its writes under one write guard.
    tables: RwLock<Tables>,

    /// One async lock per account row, held by a unit until it ends.
    row_locks: Mutex<HashMap<AccountId, Arc<RowLock<()>>>>,

    lock_timeout: Duration,

    #[cfg(test)]
    commit_failure: Mutex<Option<StoreError>>,
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Backend("in-memory table lock poisoned".to_string())
}

impl Shared {
    fn row_lock(&self, id: AccountId) -> Result<Option<Arc<RowLock<()>>>, StoreError> {
        let locks = self.row_locks.lock().map_err(poisoned)?;
        Ok(locks.get(&id).cloned())
    }

    #[cfg(test)]
    fn injected_commit_failure(&self) -> Option<StoreError> {
        self.commit_failure.lock().ok().and_then(|mut slot| slot.take())
    }

    #[cfg(not(test))]
    fn injected_commit_failure(&self) -> Option<StoreError> {
        None
    }
}

/// In-memory ledger tables with row-level locking.
///
/// Behaves like the relational backend where the ledger can observe it: reads
/// never block and see only committed state, units lock rows exclusively with a
/// bounded wait, and a unit's writes become visible all at once on commit.
/// Intended for tests and single-process runs.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        InMemoryStore {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                lock_timeout,
                #[cfg(test)]
                commit_failure: Mutex::new(None),
            }),
        }
    }

    /// Makes the next unit commit fail with `err` without applying anything.
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&self, err: StoreError) {
        if let Ok(mut slot) = self.shared.commit_failure.lock() {
            *slot = Some(err);
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn insert_account(
        &self,
        owner: OwnerId,
        currency: Currency,
    ) -> Result<Account, StoreError> {
        let mut tables = self.shared.tables.write().map_err(poisoned)?;
        tables.last_account_id += 1;
        let account = Account {
            id: AccountId(tables.last_account_id),
            owner,
            balance: Money::ZERO,
            currency,
            created_at: Utc::now(),
        };

        // Register the row lock before the row becomes visible.
        self.shared
            .row_locks
            .lock()
            .map_err(poisoned)?
            .insert(account.id, Arc::new(RowLock::new(())));
        tables.accounts.insert(account.id, account.clone());

        Ok(account)
    }

    async fn fetch_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let tables = self.shared.tables.read().map_err(poisoned)?;
        Ok(tables.accounts.get(&id).cloned())
    }

    async fn accounts_by_owner(&self, owner: OwnerId) -> Result<Vec<Account>, StoreError> {
        let tables = self.shared.tables.read().map_err(poisoned)?;
        Ok(tables
            .accounts
            .values()
            .filter(|a| a.owner == owner)
            .cloned()
            .collect())
    }

    async fn append_entries(&self, entries: &[NewEntry]) -> Result<Vec<Transaction>, StoreError> {
        let mut tables = self.shared.tables.write().map_err(poisoned)?;

        if let Some(missing) = entries
            .iter()
            .find(|e| !tables.accounts.contains_key(&e.account_id))
        {
            return Err(StoreError::Constraint(format!(
                "transaction references missing account {}",
                missing.account_id
            )));
        }
        let mut keys = HashSet::new();
        for entry in entries {
            if let Some(operation) = &entry.operation {
                let key = (operation.clone(), entry.account_id);
                if tables.operations.contains(&key) || !keys.insert(key) {
                    return Err(StoreError::Constraint(format!(
                        "operation {operation} already recorded for account {}",
                        entry.account_id
                    )));
                }
            }
        }
        tables.operations.extend(keys);

        let created_at = Utc::now();
        let mut appended = Vec::with_capacity(entries.len());
        for entry in entries {
            tables.last_entry_id += 1;
            let stored = Transaction {
                id: TransactionId(tables.last_entry_id),
                account_id: entry.account_id,
                amount: entry.amount,
                kind: entry.kind,
                status: TxStatus::Pending,
                counterparty: entry.counterparty,
                operation: entry.operation.clone(),
                created_at,
            };
            tables.entries.insert(stored.id, stored.clone());
            appended.push(stored);
        }

        Ok(appended)
    }

    async fn fetch_entry(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let tables = self.shared.tables.read().map_err(poisoned)?;
        Ok(tables.entries.get(&id).cloned())
    }

    async fn entries_for_account(&self, id: AccountId) -> Result<Vec<Transaction>, StoreError> {
        let tables = self.shared.tables.read().map_err(poisoned)?;
        Ok(tables
            .entries
            .values()
            .filter(|e| e.account_id == id)
            .cloned()
            .collect())
    }

    async fn entries_for_operation(
        &self,
        operation: &OperationId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let tables = self.shared.tables.read().map_err(poisoned)?;
        Ok(tables
            .entries
            .values()
            .filter(|e| e.operation.as_ref() == Some(operation))
            .cloned()
            .collect())
    }

    async fn pending_entries_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let tables = self.shared.tables.read().map_err(poisoned)?;
        Ok(tables
            .entries
            .values()
            .filter(|e| e.status == TxStatus::Pending && e.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn finalize_entry(
        &self,
        id: TransactionId,
        status: TxStatus,
    ) -> Result<Option<Transaction>, StoreError> {
        let mut tables = self.shared.tables.write().map_err(poisoned)?;
        match tables.entries.get_mut(&id) {
            Some(entry) if entry.status == TxStatus::Pending => {
                entry.status = status;
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(MemoryUnit {
            shared: Arc::clone(&self.shared),
            guards: Vec::new(),
            balances: BTreeMap::new(),
            statuses: BTreeMap::new(),
        }))
    }
}

/// Unit of work over [`InMemoryStore`]: holds row guards, stages writes.
struct MemoryUnit {
    shared: Arc<Shared>,
    guards: Vec<(AccountId, OwnedMutexGuard<()>)>,
    balances: BTreeMap<AccountId, Money>,
    statuses: BTreeMap<TransactionId, TxStatus>,
}

impl MemoryUnit {
    fn holds(&self, id: AccountId) -> bool {
        self.guards.iter().any(|(locked, _)| *locked == id)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        for &id in ids {
            if self.holds(id) {
                continue;
            }
            let Some(lock) = self.shared.row_lock(id)? else {
                continue;
            };
            let guard = tokio::time::timeout(self.shared.lock_timeout, lock.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout(id))?;
            self.guards.push((id, guard));
        }

        let tables = self.shared.tables.read().map_err(poisoned)?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.accounts.get(id))
            .map(|account| {
                let mut account = account.clone();
                if let Some(staged) = self.balances.get(&account.id) {
                    account.balance = *staged;
                }
                account
            })
            .collect())
    }

    async fn set_balance(&mut self, id: AccountId, balance: Money) -> Result<(), StoreError> {
        if !self.holds(id) {
            return Err(StoreError::Backend(format!(
                "balance of account {id} written without holding its row lock"
            )));
        }
        self.balances.insert(id, balance);
        Ok(())
    }

    async fn finalize_entry(
        &mut self,
        id: TransactionId,
        status: TxStatus,
    ) -> Result<bool, StoreError> {
        let pending = {
            let tables = self.shared.tables.read().map_err(poisoned)?;
            matches!(tables.entries.get(&id), Some(e) if e.status == TxStatus::Pending)
        };
        if !pending || self.statuses.contains_key(&id) {
            return Ok(false);
        }
        self.statuses.insert(id, status);
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if let Some(err) = self.shared.injected_commit_failure() {
            return Err(err);
        }

        let mut tables = self.shared.tables.write().map_err(poisoned)?;

        // Validate everything first so a rejected commit applies nothing.
        for id in self.statuses.keys() {
            match tables.entries.get(id) {
                Some(entry) if entry.status == TxStatus::Pending => {}
                _ => {
                    return Err(StoreError::Conflict(format!(
                        "transaction {id} was finalized by another writer"
                    )))
                }
            }
        }
        for (id, balance) in &self.balances {
            if balance.is_negative() {
                return Err(StoreError::Constraint(format!(
                    "balance of account {id} would become {balance}"
                )));
            }
        }

        for (id, balance) in &self.balances {
            if let Some(account) = tables.accounts.get_mut(id) {
                account.balance = *balance;
            }
        }
        for (id, status) in &self.statuses {
            if let Some(entry) = tables.entries.get_mut(id) {
                entry.status = *status;
            }
        }

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Money {
        Money::from_str(s).unwrap()
    }

    async fn funded(store: &InMemoryStore, balance: &str) -> AccountId {
        let account = store.insert_account(OwnerId(1), Currency::Usd).await.unwrap();
        let mut unit = store.begin().await.unwrap();
        unit.lock_accounts(&[account.id]).await.unwrap();
        unit.set_balance(account.id, dec(balance)).await.unwrap();
        unit.commit().await.unwrap();
        account.id
    }

    #[tokio::test]
    async fn test_ids_ascend_from_one() {
        let store = InMemoryStore::new();
        let a = store.insert_account(OwnerId(1), Currency::Usd).await.unwrap();
        let b = store.insert_account(OwnerId(1), Currency::Eur).await.unwrap();
        assert_eq!(a.id, AccountId(1));
        assert_eq!(b.id, AccountId(2));
        assert_eq!(a.balance, Money::ZERO);
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let store = InMemoryStore::new();
        let id = funded(&store, "10").await;

        let mut unit = store.begin().await.unwrap();
        let rows = unit.lock_accounts(&[id]).await.unwrap();
        assert_eq!(rows[0].balance, dec("10"));
        unit.set_balance(id, dec("4")).await.unwrap();

        assert_eq!(store.fetch_account(id).await.unwrap().unwrap().balance, dec("10"));
        unit.commit().await.unwrap();
        assert_eq!(store.fetch_account(id).await.unwrap().unwrap().balance, dec("4"));
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes_and_release_locks() {
        let store = InMemoryStore::with_lock_timeout(Duration::from_millis(50));
        let id = funded(&store, "10").await;

        let mut unit = store.begin().await.unwrap();
        unit.lock_accounts(&[id]).await.unwrap();
        unit.set_balance(id, dec("1")).await.unwrap();
        unit.rollback().await.unwrap();

        let mut unit = store.begin().await.unwrap();
        unit.lock_accounts(&[id]).await.unwrap();
        unit.set_balance(id, dec("2")).await.unwrap();
        drop(unit);

        let mut unit = store.begin().await.unwrap();
        assert_eq!(unit.lock_accounts(&[id]).await.unwrap().len(), 1);
        assert_eq!(store.fetch_account(id).await.unwrap().unwrap().balance, dec("10"));
    }

    #[tokio::test]
    async fn test_second_unit_times_out_on_held_row() {
        let store = InMemoryStore::with_lock_timeout(Duration::from_millis(50));
        let id = funded(&store, "10").await;

        let mut holder = store.begin().await.unwrap();
        holder.lock_accounts(&[id]).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.lock_accounts(&[id]).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(locked) if locked == id));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_rows_are_omitted() {
        let store = InMemoryStore::new();
        let id = funded(&store, "1").await;

        let mut unit = store.begin().await.unwrap();
        let rows = unit.lock_accounts(&[id, AccountId(99)]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(unit.set_balance(AccountId(99), dec("1")).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_rejects_negative_balance() {
        let store = InMemoryStore::new();
        let id = funded(&store, "5").await;

        let mut unit = store.begin().await.unwrap();
        unit.lock_accounts(&[id]).await.unwrap();
        unit.set_balance(id, dec("-1")).await.unwrap();
        assert!(matches!(
            unit.commit().await,
            Err(StoreError::Constraint(_))
        ));
        assert_eq!(store.fetch_account(id).await.unwrap().unwrap().balance, dec("5"));
    }

    #[tokio::test]
    async fn test_append_requires_existing_account() {
        let store = InMemoryStore::new();
        let err = store
            .append_entries(&[NewEntry::deposit(AccountId(42), dec("1"))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_commit_conflicts_when_entry_finalized_elsewhere() {
        let store = InMemoryStore::new();
        let id = funded(&store, "5").await;
        let entry = store
            .append_entries(&[NewEntry::deposit(id, dec("1"))])
            .await
            .unwrap()
            .remove(0);

        let mut unit = store.begin().await.unwrap();
        unit.lock_accounts(&[id]).await.unwrap();
        unit.set_balance(id, dec("6")).await.unwrap();
        assert!(unit.finalize_entry(entry.id, TxStatus::Completed).await.unwrap());

        store
            .finalize_entry(entry.id, TxStatus::Failed)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(unit.commit().await, Err(StoreError::Conflict(_))));
        assert_eq!(store.fetch_account(id).await.unwrap().unwrap().balance, dec("5"));
        assert_eq!(
            store.fetch_entry(entry.id).await.unwrap().unwrap().status,
            TxStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_entries_listed_in_creation_order() {
        let store = InMemoryStore::new();
        let a = funded(&store, "0").await;
        let b = funded(&store, "0").await;
        store
            .append_entries(&NewEntry::transfer_pair(a, b, dec("1")))
            .await
            .unwrap();
        store
            .append_entries(&[NewEntry::deposit(a, dec("2"))])
            .await
            .unwrap();

        let entries = store.entries_for_account(a).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].id < entries[1].id);
        assert_eq!(entries[0].amount, dec("-1"));
        assert!(entries.iter().all(|e| e.status == TxStatus::Pending));
    }

    #[tokio::test]
    async fn test_operation_key_is_unique_per_account() {
        let store = InMemoryStore::new();
        let a = store.insert_account(OwnerId(1), Currency::Usd).await.unwrap();
        let key = OperationId::from("op-1");

        let entry = NewEntry::deposit(a.id, dec("1")).with_operation(Some(key.clone()));
        store.append_entries(&[entry.clone()]).await.unwrap();
        assert!(matches!(
            store.append_entries(&[entry]).await,
            Err(StoreError::Constraint(_))
        ));

        let untagged = NewEntry::deposit(a.id, dec("1"));
        store.append_entries(&[untagged.clone()]).await.unwrap();
        store.append_entries(&[untagged]).await.unwrap();

        let recorded = store.entries_for_operation(&key).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].operation, Some(key));

        let repeated =
            NewEntry::deposit(a.id, dec("2")).with_operation(Some(OperationId::from("op-2")));
        assert!(matches!(
            store.append_entries(&[repeated.clone(), repeated.clone()]).await,
            Err(StoreError::Constraint(_))
        ));
        assert_eq!(store.append_entries(&[repeated]).await.unwrap().len(), 1);
    }
}
