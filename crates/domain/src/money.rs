//! Fixed-point money values tagged with an ISO-4217 currency.

use std::cmp::Ordering;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by money arithmetic and currency parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    /// The currency code is empty, malformed or not a supported ISO-4217 code.
    #[error("Invalid currency: {0:?}")]
    InvalidCurrency(String),

    /// A binary operation mixed two currencies.
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        left: CurrencyCode,
        right: CurrencyCode,
    },

    /// The amount has more decimal places than the currency's minor unit.
    #[error("Amount {amount} has more than {minor_units} decimal places for {currency}")]
    TooPrecise {
        amount: Decimal,
        currency: CurrencyCode,
        minor_units: u32,
    },

    /// The result does not fit the decimal representation.
    #[error("Amount overflow")]
    Overflow,
}

/// Supported currencies with their minor-unit digits.
const CURRENCIES: &[(&str, u32)] = &[
    ("ARS", 2),
    ("AUD", 2),
    ("BRL", 2),
    ("CAD", 2),
    ("CHF", 2),
    ("CLP", 0),
    ("CNY", 2),
    ("COP", 2),
    ("EUR", 2),
    ("GBP", 2),
    ("INR", 2),
    ("JPY", 0),
    ("MXN", 2),
    ("PEN", 2),
    ("USD", 2),
    ("UYU", 2),
];

/// Three-letter ISO-4217 currency code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub struct CurrencyCode(&'static str);

impl<'de> Deserialize<'de> for CurrencyCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        CurrencyCode::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl CurrencyCode {
    pub const BRL: CurrencyCode = CurrencyCode("BRL");
    pub const USD: CurrencyCode = CurrencyCode("USD");
    pub const EUR: CurrencyCode = CurrencyCode("EUR");

    /// Parses a currency code. Lower-case input is accepted.
    pub fn parse(code: &str) -> Result<Self, MoneyError> {
        let normalized = code.trim().to_ascii_uppercase();
        if normalized.len() != 3 || !normalized.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(MoneyError::InvalidCurrency(code.to_string()));
        }
        CURRENCIES
            .iter()
            .find(|(known, _)| *known == normalized)
            .map(|(known, _)| CurrencyCode(*known))
            .ok_or_else(|| MoneyError::InvalidCurrency(code.to_string()))
    }

    /// Returns the code as a string slice.
    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// Number of decimal digits of the currency's minor unit.
    pub fn minor_units(&self) -> u32 {
        CURRENCIES
            .iter()
            .find(|(known, _)| *known == self.0)
            .map(|(_, units)| *units)
            .unwrap_or(2)
    }
}

impl std::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::str::FromStr for CurrencyCode {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0.to_string()
    }
}

/// An immutable amount in one currency.
///
/// Values are never mutated; every operation returns a new `Money`. Ordering
/// is total within one currency and undefined across currencies, so
/// `partial_cmp` returns `None` when the currencies differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: CurrencyCode,
}

impl Money {
    /// Creates a money value, validating the currency code and that the
    /// amount is expressible in the currency's minor unit.
    pub fn new(amount: Decimal, currency: &str) -> Result<Self, MoneyError> {
        let money = Self {
            amount,
            currency: CurrencyCode::parse(currency)?,
        };
        money.ensure_precision()?;
        Ok(money)
    }

    /// Creates a money value from an already validated currency.
    pub fn of(amount: Decimal, currency: CurrencyCode) -> Self {
        Self { amount, currency }
    }

    /// Returns zero in the given currency.
    pub fn zero(currency: CurrencyCode) -> Self {
        Self::of(Decimal::ZERO, currency)
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> CurrencyCode {
        self.currency
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Fails when the amount carries digits below the currency's minor
    /// unit. Trailing zeros do not count.
    pub fn ensure_precision(&self) -> Result<(), MoneyError> {
        let minor_units = self.currency.minor_units();
        if self.amount.normalize().scale() > minor_units {
            return Err(MoneyError::TooPrecise {
                amount: self.amount,
                currency: self.currency,
                minor_units,
            });
        }
        Ok(())
    }

    /// Adds two amounts of the same currency.
    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::of(amount, self.currency))
    }

    /// Subtracts an amount of the same currency.
    pub fn subtract(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::of(amount, self.currency))
    }

    /// Compares two amounts of the same currency.
    pub fn checked_cmp(&self, other: &Money) -> Result<Ordering, MoneyError> {
        self.ensure_same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    fn ensure_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.checked_cmp(other).ok()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut amount = self.amount;
        amount.rescale(self.currency.minor_units());
        write!(f, "{} {}", amount, self.currency)
    }
}
