//! Account model and balance rules.
//!
//! Maintains the invariant: `balance >= 0` at every committed state.

use crate::error::LedgerError;
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account identifier, assigned ascending by the store.
///
/// Its ordering is the global lock order for multi-account units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

/// Identifier of the owning user, as verified by the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Currency tag fixed at account creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Rub,
    Usd,
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Rub => "RUB",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RUB" => Ok(Currency::Rub),
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            other => Err(format!("unknown currency {other:?}")),
        }
    }
}

/// A committed account row.
///
/// `owner`, `currency` and `created_at` never change after creation; `balance`
/// only changes through a committed ledger unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: OwnerId,
    pub balance: Money,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Balance after crediting `amount`.
    pub fn credited(&self, amount: Money) -> Result<Money, LedgerError> {
        self.balance.checked_add(amount).ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "crediting {amount} would overflow the balance of account {}",
                self.id
            ))
        })
    }

    /// Balance after debiting `amount`.
    ///
    /// Fails with `InsufficientFunds` if the balance would go negative.
    pub fn debited(&self, amount: Money) -> Result<Money, LedgerError> {
        if self.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account: self.id,
                balance: self.balance,
                requested: amount,
            });
        }
        Ok(self.balance - amount)
    }

    /// Balance after applying a signed delta (positive credits, negative debits).
    pub fn applied(&self, delta: Money) -> Result<Money, LedgerError> {
        if delta.is_negative() {
            self.debited(delta.abs())
        } else {
            self.credited(delta)
        }
    }
}
