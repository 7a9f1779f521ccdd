//! Value Objects for the pharmacy checkout

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Country calling code used for mobile money numbers.
pub const COUNTRY_CODE: &str = "254";

/// Subscriber digits that follow the country code.
const SUBSCRIBER_DIGITS: usize = 9;

/// Mobile number normalized to `254XXXXXXXXX`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Accepts `07XXXXXXXX`, `+2547XXXXXXXX`, `2547XXXXXXXX` and bare
    /// subscriber numbers; separators are ignored.
    pub fn parse(raw: &str) -> Result<Self, PhoneError> {
        let cleaned: String = raw
            .trim()
            .trim_start_matches('+')
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        if cleaned.is_empty() { return Err(PhoneError::Empty); }

        let normalized = if let Some(rest) = cleaned.strip_prefix('0') {
            format!("{COUNTRY_CODE}{rest}")
        } else if cleaned.starts_with(COUNTRY_CODE) {
            cleaned
        } else {
            format!("{COUNTRY_CODE}{cleaned}")
        };

        let subscriber = &normalized[COUNTRY_CODE.len()..];
        if subscriber.len() != SUBSCRIBER_DIGITS || !subscriber.chars().all(|c| c.is_ascii_digit()) {
            return Err(PhoneError::Malformed(raw.trim().to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl TryFrom<String> for PhoneNumber {
    type Error = PhoneError;
    fn try_from(value: String) -> Result<Self, Self::Error> { Self::parse(&value) }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self { value.0 }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum PhoneError { Empty, Malformed(String) }
impl std::error::Error for PhoneError {}
impl fmt::Display for PhoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Phone number is required"),
            Self::Malformed(raw) => write!(f, "Invalid phone number '{raw}', expected format 07XXXXXXXX or 2547XXXXXXXX"),
        }
    }
}

/// Money value object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money { amount: Decimal, currency: String }

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> Self { Self { amount, currency: currency.to_string() } }
    pub fn zero(currency: &str) -> Self { Self::new(Decimal::ZERO, currency) }
    pub fn amount(&self) -> Decimal { self.amount }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        if self.currency != other.currency { return Err(MoneyError::CurrencyMismatch); }
        let amount = self.amount.checked_add(other.amount).ok_or(MoneyError::Overflow)?;
        Ok(Money::new(amount, &self.currency))
    }

    /// Rounds to whole units, half away from zero.
    pub fn whole_units(&self) -> Decimal {
        self.amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Converts with a fixed rate, rounded to cents.
    pub fn convert(&self, rate: Decimal, currency: &str) -> Result<Money, MoneyError> {
        let converted = self.amount.checked_mul(rate).ok_or(MoneyError::Overflow)?;
        Ok(Money::new(converted.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero), currency))
    }

    /// True when both amounts differ by no more than `tolerance`.
    pub fn approx_eq(&self, other: Decimal, tolerance: Decimal) -> bool {
        self.amount.checked_sub(other).is_some_and(|d| d.abs() <= tolerance)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum MoneyError { CurrencyMismatch, Overflow }
impl std::error::Error for MoneyError {}
impl fmt::Display for MoneyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CurrencyMismatch => write!(f, "Currency mismatch"),
            Self::Overflow => write!(f, "Amount is too large"),
        }
    }
}

/// Human readable order code, `ORD` + date + random suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderReference(String);

impl OrderReference {
    const SUFFIX_LEN: usize = 6;

    pub fn generate(at: DateTime<Utc>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(Self::SUFFIX_LEN)
            .map(|b| char::from(b).to_ascii_uppercase())
            .collect();
        Self(format!("ORD{}{}", at.format("%Y%m%d"), suffix))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for OrderReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl From<String> for OrderReference {
    fn from(value: String) -> Self { Self(value) }
}
