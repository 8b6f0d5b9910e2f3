//! Currency-tagged money in integer minor units.
//!
//! Amounts are stored as `i64` minor units (cents for USD) so that pricing and
//! refund arithmetic is exact. Every binary operation checks that both operands
//! carry the same currency; mixing currencies is a validation error, never an
//! implicit conversion.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// ISO-4217 style three-letter currency code (upper-case ASCII).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    pub const USD: Currency = Currency(*b"USD");
    pub const EUR: Currency = Currency(*b"EUR");
    pub const GBP: Currency = Currency(*b"GBP");

    pub fn new(code: &str) -> DomainResult<Self> {
        let bytes = code.trim().as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(DomainError::validation(format!(
                "currency code must be three letters, got '{code}'"
            )));
        }
        let mut out = [0u8; 3];
        for (slot, b) in out.iter_mut().zip(bytes) {
            *slot = b.to_ascii_uppercase();
        }
        Ok(Self(out))
    }

    pub fn code(&self) -> &str {
        // Constructed from validated ASCII only.
        core::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.code().to_string()
    }
}

/// A monetary amount in minor units, tagged with its currency.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// Amount in the smallest currency unit (e.g. cents).
    amount: i64,
    currency: Currency,
}

impl ValueObject for Money {}

impl Money {
    pub const fn new(amount: i64, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub const fn zero(currency: Currency) -> Self {
        Self::new(0, currency)
    }

    /// `from_major_minor(10, 50, USD)` is 10.50 USD. A negative major unit makes
    /// the whole amount negative.
    pub fn from_major_minor(major: i64, minor: u8, currency: Currency) -> DomainResult<Self> {
        if minor > 99 {
            return Err(DomainError::validation("minor unit must be below 100"));
        }
        let amount = major
            .checked_mul(100)
            .and_then(|m| {
                if major < 0 {
                    m.checked_sub(i64::from(minor))
                } else {
                    m.checked_add(i64::from(minor))
                }
            })
            .ok_or_else(|| DomainError::validation("amount overflow"))?;
        Ok(Self::new(amount, currency))
    }

    pub const fn amount(&self) -> i64 {
        self.amount
    }

    pub const fn currency(&self) -> Currency {
        self.currency
    }

    pub const fn is_zero(&self) -> bool {
        self.amount == 0
    }

    pub const fn is_positive(&self) -> bool {
        self.amount > 0
    }

    pub const fn is_negative(&self) -> bool {
        self.amount < 0
    }

    pub fn ensure_same_currency(&self, other: &Money) -> DomainResult<()> {
        if self.currency != other.currency {
            return Err(DomainError::validation(format!(
                "currency mismatch: {} vs {}",
                self.currency, other.currency
            )));
        }
        Ok(())
    }

    pub fn checked_add(self, other: Money) -> DomainResult<Money> {
        self.ensure_same_currency(&other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| DomainError::validation("amount overflow"))?;
        Ok(Money::new(amount, self.currency))
    }

    pub fn checked_sub(self, other: Money) -> DomainResult<Money> {
        self.ensure_same_currency(&other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or_else(|| DomainError::validation("amount overflow"))?;
        Ok(Money::new(amount, self.currency))
    }

    pub fn multiply_quantity(self, quantity: u32) -> DomainResult<Money> {
        let amount = self
            .amount
            .checked_mul(i64::from(quantity))
            .ok_or_else(|| DomainError::validation("amount overflow"))?;
        Ok(Money::new(amount, self.currency))
    }

    /// Percentage of this amount in basis points (800 = 8%), rounded half away
    /// from zero to the nearest minor unit.
    pub fn percentage_bps(self, bps: u32) -> Money {
        let raw = i128::from(self.amount) * i128::from(bps);
        let rounded = if raw >= 0 {
            (raw + 5_000) / 10_000
        } else {
            (raw - 5_000) / 10_000
        };
        Money::new(rounded as i64, self.currency)
    }

    /// `true` when `self > other`; fails on currency mismatch.
    pub fn exceeds(&self, other: &Money) -> DomainResult<bool> {
        self.ensure_same_currency(other)?;
        Ok(self.amount > other.amount)
    }

    /// Sum a sequence of amounts, all of which must be in `currency`.
    pub fn sum<'a>(
        currency: Currency,
        items: impl IntoIterator<Item = &'a Money>,
    ) -> DomainResult<Money> {
        items
            .into_iter()
            .try_fold(Money::zero(currency), |acc, m| acc.checked_add(*m))
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.amount < 0 { "-" } else { "" };
        let abs = self.amount.unsigned_abs();
        write!(f, "{sign}{}.{:02} {}", abs / 100, abs % 100, self.currency)
    }
}
