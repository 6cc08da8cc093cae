//! Transaction log: append `PENDING` entries, finalize each exactly once.
//!
//! Finalization is idempotent for the status already recorded, so a retried final
//! write is harmless; a conflicting terminal status is rejected.

use crate::account::AccountId;
use crate::error::{LedgerError, LedgerResult};
use crate::money::Money;
use crate::store::SharedStore;
use crate::transaction::{NewEntry, OperationId, Transaction, TransactionId, TxKind, TxStatus};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

#[derive(Clone)]
pub struct TransactionLog {
    store: SharedStore,
}

impl TransactionLog {
    pub fn new(store: SharedStore) -> Self {
        TransactionLog { store }
    }

    /// Records a single-account entry in `PENDING` status.
    ///
    /// `amount` is the signed delta the entry stands for.
    pub async fn record(
        &self,
        account_id: AccountId,
        amount: Money,
        kind: TxKind,
    ) -> LedgerResult<Transaction> {
        let mut entries = self
            .append(&[NewEntry {
                account_id,
                amount,
                kind,
                counterparty: None,
                operation: None,
            }])
            .await?;
        entries
            .pop()
            .ok_or_else(|| LedgerError::InvalidAmount("no entry recorded".to_string()))
    }

    /// Appends entries in `PENDING` status, all or none.
    pub async fn append(&self, entries: &[NewEntry]) -> LedgerResult<Vec<Transaction>> {
        if let Some(zero) = entries.iter().find(|e| e.amount.is_zero()) {
            return Err(LedgerError::InvalidAmount(format!(
                "zero-amount entry for account {}",
                zero.account_id
            )));
        }
        let appended = self.store.append_entries(entries).await?;
        for entry in &appended {
            debug!(
                "Recorded {} {} for account {} as {}",
                entry.kind, entry.amount, entry.account_id, entry.id
            );
        }
        Ok(appended)
    }

    pub async fn mark_completed(&self, id: TransactionId) -> LedgerResult<Transaction> {
        self.finalize(id, TxStatus::Completed).await
    }

    pub async fn mark_failed(&self, id: TransactionId) -> LedgerResult<Transaction> {
        self.finalize(id, TxStatus::Failed).await
    }

    async fn finalize(&self, id: TransactionId, status: TxStatus) -> LedgerResult<Transaction> {
        if let Some(entry) = self.store.finalize_entry(id, status).await? {
            debug!("Transaction {} -> {}", id, status);
            return Ok(entry);
        }

        let current = self
            .store
            .fetch_entry(id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(id))?;
        current.status.transition(id, status)?;
        Ok(current)
    }

    /// Marks every entry in `ids` `FAILED`, logging instead of returning errors.
    ///
    /// Used after an aborted unit, where the caller reports the original failure.
    pub(crate) async fn fail_all(&self, ids: &[TransactionId]) {
        for &id in ids {
            if let Err(e) = self.mark_failed(id).await {
                warn!("Could not mark transaction {} FAILED: {}", id, e);
            }
        }
    }

    pub async fn get(&self, id: TransactionId) -> LedgerResult<Transaction> {
        self.store
            .fetch_entry(id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    /// Entries of one account in creation order.
    pub async fn list(&self, account_id: AccountId) -> LedgerResult<Vec<Transaction>> {
        Ok(self.store.entries_for_account(account_id).await?)
    }

    /// Entries written under `operation`, in creation order.
    pub async fn for_operation(&self, operation: &OperationId) -> LedgerResult<Vec<Transaction>> {
        Ok(self.store.entries_for_operation(operation).await?)
    }

    /// Fails `PENDING` entries created before `cutoff`.
    ///
    /// A `PENDING` entry never has its balance change committed, so failing it is
    /// always safe. An attempt still in flight for one of them loses its
    /// finalization and aborts.
    pub async fn fail_pending_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<Vec<Transaction>> {
        let mut failed = Vec::new();
        for entry in self.store.pending_entries_before(cutoff).await? {
            if let Some(entry) = self.store.finalize_entry(entry.id, TxStatus::Failed).await? {
                failed.push(entry);
            }
        }
        if !failed.is_empty() {
            info!("Failed {} stale PENDING transaction(s)", failed.len());
        }
        Ok(failed)
    }
}
