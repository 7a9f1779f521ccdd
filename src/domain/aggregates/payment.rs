//! Payment Transaction Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub provider: PaymentProvider,
    pub external_reference: Option<String>,
    pub receipt: Option<String>,
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    #[serde(skip)]
    pub raw_response: Option<serde_json::Value>,
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider { Mpesa, Paypal, Cash }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus { #[default] Pending, Completed, Failed, Cancelled }

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Mpesa => "mpesa", Self::Paypal => "paypal", Self::Cash => "cash" }
    }

    /// Accepts the storefront's historical spellings as well.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mpesa" | "m-pesa" | "mobile_money" => Some(Self::Mpesa),
            "paypal" | "card" => Some(Self::Paypal),
            "cash" | "cod" | "cash_on_delivery" => Some(Self::Cash),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Completed => "completed", Self::Failed => "failed", Self::Cancelled => "cancelled" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s { "pending" => Some(Self::Pending), "completed" => Some(Self::Completed), "failed" => Some(Self::Failed), "cancelled" => Some(Self::Cancelled), _ => None }
    }

    pub fn is_terminal(&self) -> bool { !matches!(self, Self::Pending) }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl PaymentTransaction {
    pub fn pending(order_id: Uuid, amount: Decimal, currency: &str, provider: PaymentProvider) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(), order_id, amount, currency: currency.to_string(), provider,
            external_reference: None, receipt: None, status: TransactionStatus::Pending,
            failure_reason: None, raw_response: None, simulated: false, created_at: now, updated_at: now,
        }
    }

    pub fn complete(&mut self, receipt: Option<String>, raw: serde_json::Value) -> Result<(), TransactionError> {
        self.settle(TransactionStatus::Completed)?;
        self.receipt = receipt;
        self.raw_response = Some(raw);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, raw: serde_json::Value) -> Result<(), TransactionError> {
        self.settle(TransactionStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        self.raw_response = Some(raw);
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TransactionError> {
        self.settle(TransactionStatus::Cancelled)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// The compare-and-swap: only a pending transaction can settle.
    fn settle(&mut self, to: TransactionStatus) -> Result<(), TransactionError> {
        if self.status.is_terminal() { return Err(TransactionError::AlreadySettled(self.status)); }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum TransactionError { AlreadySettled(TransactionStatus) }
impl std::error::Error for TransactionError {}
impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { Self::AlreadySettled(s) => write!(f, "Transaction already {s}") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_is_never_overwritten() {
        let mut tx = PaymentTransaction::pending(Uuid::new_v4(), Decimal::from(250), "KES", PaymentProvider::Mpesa);
        tx.complete(Some("QFX12AB".into()), serde_json::json!({"ok": true})).unwrap();
        assert_eq!(tx.fail("late", serde_json::Value::Null), Err(TransactionError::AlreadySettled(TransactionStatus::Completed)));
        assert_eq!(tx.receipt.as_deref(), Some("QFX12AB"));
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[test]
    fn test_provider_spellings() {
        assert_eq!(PaymentProvider::parse("M-Pesa"), Some(PaymentProvider::Mpesa));
        assert_eq!(PaymentProvider::parse("paypal"), Some(PaymentProvider::Paypal));
        assert_eq!(PaymentProvider::parse("cod"), Some(PaymentProvider::Cash));
        assert_eq!(PaymentProvider::parse("bitcoin"), None);
    }
}
