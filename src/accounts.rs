//! Account creation and lookup.
//!
//! No balance mutation is exposed here; balances change only through
//! [`BalanceLedger`](crate::balance::BalanceLedger) so that every change is logged.

use crate::account::{Account, AccountId, Currency, OwnerId};
use crate::error::{LedgerError, LedgerResult};
use crate::store::SharedStore;
use log::info;

#[derive(Clone)]
pub struct AccountStore {
    store: SharedStore,
}

impl AccountStore {
    pub fn new(store: SharedStore) -> Self {
        AccountStore { store }
    }

    /// Creates an account with a zero balance in `currency`.
    pub async fn create(&self, owner: OwnerId, currency: Currency) -> LedgerResult<Account> {
        let account = self.store.insert_account(owner, currency).await?;
        info!(
            "Opened account {} ({}) for owner {}",
            account.id, account.currency, owner
        );
        Ok(account)
    }

    pub async fn get(&self, id: AccountId) -> LedgerResult<Account> {
        self.store
            .fetch_account(id)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// Accounts of `owner` ascending by id; empty if the owner has none.
    pub async fn list_by_owner(&self, owner: OwnerId) -> LedgerResult<Vec<Account>> {
        Ok(self.store.accounts_by_owner(owner).await?)
    }
}
