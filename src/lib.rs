//! # Account Ledger
//!
//! Account balances with a transaction log, safe under concurrent callers.
//!
//! ## Design Principles
//!
//! - **Fixed-point money**: 4 decimal places via `rust_decimal`; excess precision is rejected
//! - **Write-ahead log**: every balance change is preceded by a `PENDING` log entry
//!   and finishes `COMPLETED` or `FAILED`
//! - **Row locks in ascending id order**: transfers in opposite directions never deadlock
//! - **Retry keys**: `*_once` operations run at most once per caller-supplied key
//! - **Pluggable storage**: an in-memory store and a Postgres store behind one trait
//!
//! ## Example
//!
//! ```no_run
//! use account_ledger::{Currency, Ledger, Money, OwnerId};
//! use std::str::FromStr;
//!
//! # async fn demo() -> Result<(), account_ledger::LedgerError> {
//! let ledger = Ledger::in_memory();
//! let a = ledger.create_account(OwnerId(1), Currency::Usd).await?;
//! let b = ledger.create_account(OwnerId(2), Currency::Usd).await?;
//! ledger.deposit(a.id, Money::from_str("100").unwrap()).await?;
//! ledger.transfer(a.id, b.id, Money::from_str("40").unwrap()).await?;
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod accounts;
pub mod balance;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod money;
pub mod store;
pub mod transaction;
pub mod transfer;

pub use account::{Account, AccountId, Currency, OwnerId};
pub use config::Config;
pub use engine::LedgerEngine;
pub use error::{EngineError, ErrorKind, LedgerError, LedgerResult, Result, StoreError};
pub use ledger::{CardAuthorization, Ledger};
pub use money::Money;
pub use store::{InMemoryStore, LedgerStore, PostgresStore, SharedStore, UnitOfWork};
pub use transaction::{OperationId, Transaction, TransactionId, TxKind, TxStatus};
