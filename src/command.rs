//! Batch command records as read from CSV.

use crate::account::{AccountId, Currency, OwnerId};
use crate::money::Money;
use serde::Deserialize;
use std::str::FromStr;

/// Raw command row.
///
/// Every column except `op` is optional at this stage; which ones are required
/// depends on the operation.
#[derive(Debug, Deserialize)]
pub struct CommandRecord {
    /// open, deposit, withdraw, adjust or transfer
    pub op: String,

    pub owner: Option<i64>,

    /// Target account; the source account of a transfer.
    pub account: Option<i64>,

    /// Destination account of a transfer.
    pub counterparty: Option<i64>,

    pub amount: Option<String>,

    pub currency: Option<String>,
}

/// A parsed command ready to run against the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open { owner: OwnerId, currency: Currency },
    Deposit { account: AccountId, amount: Money },
    Withdraw { account: AccountId, amount: Money },
    /// Signed balance change.
    Adjust { account: AccountId, delta: Money },
    Transfer { from: AccountId, to: AccountId, amount: Money },
}

impl Command {
    /// Accounts the command refers to.
    pub fn accounts(&self) -> Vec<AccountId> {
        match *self {
            Command::Open { .. } => Vec::new(),
            Command::Deposit { account, .. }
            | Command::Withdraw { account, .. }
            | Command::Adjust { account, .. } => vec![account],
            Command::Transfer { from, to, .. } => vec![from, to],
        }
    }
}

impl CommandRecord {
    /// Parses the raw row into a typed command, naming the first problem found.
    pub fn parse(&self) -> Result<Command, String> {
        match self.op.trim().to_lowercase().as_str() {
            "open" => Ok(Command::Open {
                owner: OwnerId(self.owner.ok_or("missing owner")?),
                currency: self.parse_currency()?,
            }),
            "deposit" => Ok(Command::Deposit {
                account: self.account()?,
                amount: self.parse_amount()?,
            }),
            "withdraw" => Ok(Command::Withdraw {
                account: self.account()?,
                amount: self.parse_amount()?,
            }),
            "adjust" => Ok(Command::Adjust {
                account: self.account()?,
                delta: self.parse_amount()?,
            }),
            "transfer" => Ok(Command::Transfer {
                from: self.account()?,
                to: AccountId(self.counterparty.ok_or("missing counterparty")?),
                amount: self.parse_amount()?,
            }),
            other => Err(format!("unknown operation '{other}'")),
        }
    }

    fn account(&self) -> Result<AccountId, String> {
        self.account
            .map(AccountId)
            .ok_or_else(|| "missing account".to_string())
    }

    fn parse_amount(&self) -> Result<Money, String> {
        let raw = self.amount.as_deref().map(str::trim).unwrap_or("");
        if raw.is_empty() {
            return Err("missing amount".to_string());
        }
        Money::from_str(raw).map_err(|e| e.to_string())
    }

    fn parse_currency(&self) -> Result<Currency, String> {
        let raw = self.currency.as_deref().map(str::trim).unwrap_or("");
        if raw.is_empty() {
            return Err("missing currency".to_string());
        }
        Currency::from_str(raw)
    }
}
