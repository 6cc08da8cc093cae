//! Exact monetary amounts with 4 decimal places precision.
//!
//! Wraps `rust_decimal` with a fixed scale. Amounts that would need rounding to
//! fit that scale are rejected instead of rounded, so every stored balance is the
//! exact sum of the deltas applied to it.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when constructing a [`Money`] value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("not a decimal amount: {0}")]
    Parse(String),

    #[error("amount {0} has more than {scale} fractional digits", scale = Money::SCALE)]
    TooPrecise(Decimal),

    #[error("amount {0} exceeds the largest storable magnitude {max}", max = Money::MAX)]
    OutOfRange(Decimal),
}

/// A signed, exact decimal amount held at [`Money::SCALE`] fractional digits.
///
/// Negative values only appear as balance deltas (withdrawals, the debit side of a
/// transfer). Operation inputs are validated to be strictly positive.
///
/// # Examples
///
/// ```
/// use std::str::FromStr;
/// use account_ledger::Money;
///
/// let amount = Money::from_str("10.5").unwrap();
/// assert_eq!(amount.to_string(), "10.5000");
/// assert!(Money::from_str("0.00001").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(Decimal);

impl Money {
    /// The number of decimal places kept for every amount.
    pub const SCALE: u32 = 4;

    /// Zero value.
    pub const ZERO: Self = Money(Decimal::ZERO);

    /// Largest magnitude a balance or amount may take: 16 integer digits and 4
    /// fractional ones, as stored in a `NUMERIC(20, 4)` column.
    pub const MAX: Self = Money(Decimal::from_parts(0x630F_FFFF, 0x6BC7_5E2D, 0x5, false, 4));

    /// Creates a `Money` from a `Decimal`, padding it to 4 decimal places.
    ///
    /// Fails if the value carries non-zero digits beyond the fourth place or its
    /// magnitude exceeds [`Money::MAX`].
    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value.normalize().scale() > Self::SCALE {
            return Err(AmountError::TooPrecise(value));
        }
        if value.abs() > Self::MAX.0 {
            return Err(AmountError::OutOfRange(value));
        }
        let mut scaled = value;
        scaled.rescale(Self::SCALE);
        Ok(Money(scaled))
    }

    /// Builds an amount from an integer number of minor units (1/10000).
    pub fn from_minor(units: i64) -> Self {
        Money(Decimal::new(units, Self::SCALE))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Addition that returns `None` when the result leaves `±MAX`.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).and_then(Self::bounded)
    }

    /// Subtraction that returns `None` when the result leaves `±MAX`.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).and_then(Self::bounded)
    }

    fn bounded(value: Decimal) -> Option<Self> {
        (value.abs() <= Self::MAX.0).then_some(Money(value))
    }
}

impl FromStr for Money {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let decimal =
            Decimal::from_str(trimmed).map_err(|e| AmountError::Parse(format!("{trimmed:?}: {e}")))?;
        Money::new(decimal)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl Serialize for Money {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Money::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_pads_scale() {
        assert_eq!(Money::from_str("1").unwrap().to_string(), "1.0000");
        assert_eq!(Money::from_str("1.5").unwrap().to_string(), "1.5000");
        assert_eq!(Money::from_str("1.1234").unwrap().to_string(), "1.1234");
        assert_eq!(Money::from_str("  2.5  ").unwrap().to_string(), "2.5000");
    }

    #[test]
    fn test_trailing_zeros_beyond_scale_are_exact() {
        let m = Money::from_str("3.140000").unwrap();
        assert_eq!(m.to_string(), "3.1400");
    }

    #[test]
    fn test_rejects_excess_precision() {
        assert!(matches!(
            Money::from_str("0.00001"),
            Err(AmountError::TooPrecise(_))
        ));
    }

    #[test]
    fn test_max_matches_storage_precision() {
        assert_eq!(Money::MAX.to_string(), "9999999999999999.9999");
        assert_eq!(Money::from_str("9999999999999999.9999").unwrap(), Money::MAX);
        assert!(matches!(
            Money::from_str("10000000000000000"),
            Err(AmountError::OutOfRange(_))
        ));
        assert!(matches!(
            Money::from_str("-100000000000000000"),
            Err(AmountError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_checked_add_stops_at_max() {
        let one = Money::from_str("0.0001").unwrap();
        assert_eq!(Money::MAX.checked_add(one), None);
        assert_eq!(Money::MAX.checked_sub(one).unwrap().checked_add(one), Some(Money::MAX));
        assert_eq!((-Money::MAX).checked_sub(one), None);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(Money::from_str("ten"), Err(AmountError::Parse(_))));
        assert!(matches!(Money::from_str(""), Err(AmountError::Parse(_))));
    }

    #[test]
    fn test_repeated_addition_does_not_drift() {
        let tenth = Money::from_str("0.1").unwrap();
        let mut sum = Money::ZERO;
        for _ in 0..1000 {
            sum = sum.checked_add(tenth).unwrap();
        }
        assert_eq!(sum, Money::from_str("100").unwrap());
    }

    #[test]
    fn test_sign_helpers() {
        let positive = Money::from_str("1.0").unwrap();
        let negative = -positive;

        assert!(positive.is_positive());
        assert!(negative.is_negative());
        assert_eq!(negative.abs(), positive);
        assert_eq!((positive - negative).to_string(), "2.0000");
        assert!(Money::ZERO.is_zero());
        assert!(!Money::ZERO.is_positive());
    }

    #[test]
    fn test_checked_ops_report_overflow() {
        let max = Money(Decimal::MAX);
        assert!(max.checked_add(Money::from_minor(10_000)).is_none());
        assert!((-max).checked_sub(Money::from_minor(10_000)).is_none());
    }

    #[test]
    fn test_from_minor() {
        assert_eq!(Money::from_minor(12_345).to_string(), "1.2345");
    }
}
