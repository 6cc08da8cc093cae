//! Error types for the ledger, its storage layer, and the batch engine.

use crate::account::{AccountId, Currency};
use crate::money::{AmountError, Money};
use crate::transaction::{TransactionId, TxStatus};
use thiserror::Error;

/// Result type alias for batch engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Failures raised by a [`LedgerStore`](crate::store::LedgerStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Row lock could not be acquired within the configured wait.
    #[error("timed out waiting for the row lock on account {0}")]
    LockTimeout(AccountId),

    #[error("deadlock detected by the storage engine")]
    Deadlock,

    /// Serialization failure or a concurrent writer finalized the same entry.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// A storage-level constraint (non-negative balance, foreign key) rejected the write.
    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("failed to decode stored row: {0}")]
    Decode(String),

    /// The commit was sent but its outcome was never acknowledged.
    #[error("commit outcome unknown: {0}")]
    CommitUnacknowledged(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// `true` when the caller cannot tell whether the unit committed.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, StoreError::CommitUnacknowledged(_))
    }

    /// `true` for failures that left no effect and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout(_) | StoreError::Deadlock | StoreError::Conflict(_)
        )
    }
}

/// Stable failure kinds handed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InsufficientFunds,
    InvalidAmount,
    SameAccount,
    CurrencyMismatch,
    InvalidStateTransition,
    PaymentNotAuthorized,
    Persistence,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::InvalidAmount => "INVALID_AMOUNT",
            ErrorKind::SameAccount => "SAME_ACCOUNT",
            ErrorKind::CurrencyMismatch => "CURRENCY_MISMATCH",
            ErrorKind::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorKind::PaymentNotAuthorized => "PAYMENT_NOT_AUTHORIZED",
            ErrorKind::Persistence => "PERSISTENCE",
        }
    }
}

/// Errors returned by ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    /// The debit would drive the account below zero. The account is untouched.
    #[error("insufficient funds on account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Money,
        requested: Money,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("source and destination are the same account ({0})")]
    SameAccount(AccountId),

    #[error("cannot move {from} into a {to} account")]
    CurrencyMismatch { from: Currency, to: Currency },

    #[error("transaction {id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        id: TransactionId,
        from: TxStatus,
        to: TxStatus,
    },

    #[error("card payment was not authorized")]
    PaymentNotAuthorized,

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::AccountNotFound(_) | LedgerError::TransactionNotFound(_) => {
                ErrorKind::NotFound
            }
            LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LedgerError::InvalidAmount(_) => ErrorKind::InvalidAmount,
            LedgerError::SameAccount(_) => ErrorKind::SameAccount,
            LedgerError::CurrencyMismatch { .. } => ErrorKind::CurrencyMismatch,
            LedgerError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            LedgerError::PaymentNotAuthorized => ErrorKind::PaymentNotAuthorized,
            LedgerError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// `true` only when a commit was attempted and its acknowledgment was lost.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, LedgerError::Persistence(e) if e.is_indeterminate())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Persistence(e) if e.is_retryable())
    }
}

impl From<AmountError> for LedgerError {
    fn from(err: AmountError) -> Self {
        LedgerError::InvalidAmount(err.to_string())
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown store backend {0:?} (expected \"memory\" or \"postgres\")")]
    UnknownBackend(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Errors that can occur while running a command batch.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Failed to open or read the input file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing or writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A ledger failure that aborts the batch (storage problems).
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Missing input file argument
    #[error("Missing input file argument. Usage: account-ledger <commands.csv> [journal.csv]")]
    MissingArgument,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        let err = LedgerError::SameAccount(AccountId(1));
        assert_eq!(err.kind(), ErrorKind::SameAccount);
        assert_eq!(err.kind().as_str(), "SAME_ACCOUNT");

        let err = LedgerError::TransactionNotFound(TransactionId(9));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_persistence_classification() {
        let lost = LedgerError::from(StoreError::CommitUnacknowledged("eof".into()));
        assert!(lost.is_indeterminate());
        assert!(!lost.is_retryable());

        let timeout = LedgerError::from(StoreError::LockTimeout(AccountId(3)));
        assert!(!timeout.is_indeterminate());
        assert!(timeout.is_retryable());
        assert_eq!(timeout.kind(), ErrorKind::Persistence);

        let rejected = LedgerError::InvalidAmount("zero".into());
        assert!(!rejected.is_indeterminate());
    }
}
