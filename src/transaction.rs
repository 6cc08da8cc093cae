//! Transaction log entries and their lifecycle.

use crate::account::AccountId;
use crate::error::LedgerError;
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transaction log entry identifier, assigned ascending in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Caller-supplied key that makes a mutating request safe to retry.
///
/// Entries written for a request carry its key; a repeated request with the same
/// key reports those entries instead of running again.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(key: &str) -> Self {
        OperationId(key.to_string())
    }
}

/// Kind of ledger-affecting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxKind {
    /// Credit funds to an account.
    Deposit,

    /// Debit funds from an account (only if the balance covers it).
    Withdrawal,

    /// One side of a transfer between two accounts.
    Transfer,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Deposit => "DEPOSIT",
            TxKind::Withdrawal => "WITHDRAWAL",
            TxKind::Transfer => "TRANSFER",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(TxKind::Deposit),
            "WITHDRAWAL" => Ok(TxKind::Withdrawal),
            "TRANSFER" => Ok(TxKind::Transfer),
            other => Err(format!("unknown transaction type {other:?}")),
        }
    }
}

/// Lifecycle status of a log entry.
///
/// `PENDING` moves exactly once to `COMPLETED` or `FAILED`; terminal statuses
/// never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Pending,
    Completed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Completed => "COMPLETED",
            TxStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }

    /// Checks a transition of entry `id` from `self` to `to`.
    ///
    /// Returns `Ok(true)` when the status changes, `Ok(false)` when `to` is the
    /// terminal status already recorded (a retried finalization).
    pub fn transition(self, id: TransactionId, to: TxStatus) -> Result<bool, LedgerError> {
        match (self, to) {
            (_, TxStatus::Pending) => Err(LedgerError::InvalidStateTransition { id, from: self, to }),
            (TxStatus::Pending, _) => Ok(true),
            (from, to) if from == to => Ok(false),
            (from, to) => Err(LedgerError::InvalidStateTransition { id, from, to }),
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TxStatus::Pending),
            "COMPLETED" => Ok(TxStatus::Completed),
            "FAILED" => Ok(TxStatus::Failed),
            other => Err(format!("unknown transaction status {other:?}")),
        }
    }
}

/// An entry about to be appended to the log in `PENDING` status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub account_id: AccountId,

    /// Signed balance delta: negative for withdrawals and the debit side of a transfer.
    pub amount: Money,

    pub kind: TxKind,

    /// The other account of a transfer.
    pub counterparty: Option<AccountId>,

    pub operation: Option<OperationId>,
}

impl NewEntry {
    pub fn deposit(account_id: AccountId, amount: Money) -> Self {
        NewEntry {
            account_id,
            amount,
            kind: TxKind::Deposit,
            counterparty: None,
            operation: None,
        }
    }

    pub fn withdrawal(account_id: AccountId, amount: Money) -> Self {
        NewEntry {
            account_id,
            amount: -amount,
            kind: TxKind::Withdrawal,
            counterparty: None,
            operation: None,
        }
    }

    pub fn with_operation(mut self, operation: Option<OperationId>) -> Self {
        self.operation = operation;
        self
    }

    /// The debit and credit entries of a transfer, in that order.
    pub fn transfer_pair(from: AccountId, to: AccountId, amount: Money) -> [Self; 2] {
        [
            NewEntry {
                account_id: from,
                amount: -amount,
                kind: TxKind::Transfer,
                counterparty: Some(to),
                operation: None,
            },
            NewEntry {
                account_id: to,
                amount,
                kind: TxKind::Transfer,
                counterparty: Some(from),
                operation: None,
            },
        ]
    }
}

/// A stored transaction log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,

    /// Signed delta; equals exactly what was (or would have been) applied.
    pub amount: Money,

    #[serde(rename = "type")]
    pub kind: TxKind,

    pub status: TxStatus,
    pub counterparty: Option<AccountId>,

    /// Key of the request that wrote the entry, if the caller supplied one.
    pub operation: Option<OperationId>,

    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: TransactionId = TransactionId(1);

    #[test]
    fn test_pending_moves_to_either_terminal() {
        assert!(TxStatus::Pending.transition(ID, TxStatus::Completed).unwrap());
        assert!(TxStatus::Pending.transition(ID, TxStatus::Failed).unwrap());
    }

    #[test]
    fn test_repeating_terminal_status_is_noop() {
        assert!(!TxStatus::Completed.transition(ID, TxStatus::Completed).unwrap());
        assert!(!TxStatus::Failed.transition(ID, TxStatus::Failed).unwrap());
    }

    #[test]
    fn test_conflicting_terminal_status_is_rejected() {
        let err = TxStatus::Completed
            .transition(ID, TxStatus::Failed)
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidStateTransition {
                from: TxStatus::Completed,
                to: TxStatus::Failed,
                ..
            }
        ));
        assert!(TxStatus::Failed.transition(ID, TxStatus::Completed).is_err());
    }

    #[test]
    fn test_nothing_returns_to_pending() {
        assert!(TxStatus::Pending.transition(ID, TxStatus::Pending).is_err());
        assert!(TxStatus::Failed.transition(ID, TxStatus::Pending).is_err());
    }

    #[test]
    fn test_transfer_pair_signs_and_counterparties() {
        let amount = Money::from_minor(400_000);
        let [debit, credit] = NewEntry::transfer_pair(AccountId(1), AccountId(2), amount);

        assert_eq!(debit.amount, -amount);
        assert_eq!(debit.counterparty, Some(AccountId(2)));
        assert_eq!(credit.amount, amount);
        assert_eq!(credit.counterparty, Some(AccountId(1)));
        assert_eq!(debit.kind, TxKind::Transfer);
    }

    #[test]
    fn test_withdrawal_entry_is_negative() {
        let entry = NewEntry::withdrawal(AccountId(3), Money::from_minor(10_000));
        assert_eq!(entry.amount.to_string(), "-1.0000");
        assert_eq!(entry.kind, TxKind::Withdrawal);
    }

    #[test]
    fn test_status_text_round_trip() {
        for status in [TxStatus::Pending, TxStatus::Completed, TxStatus::Failed] {
            assert_eq!(TxStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert_eq!(TxKind::from_str("TRANSFER").unwrap(), TxKind::Transfer);
    }
}
