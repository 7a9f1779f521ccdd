//! Order Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use crate::domain::aggregates::payment::PaymentProvider;
use crate::domain::value_objects::{Money, MoneyError, OrderReference, PhoneNumber};

#[derive(Clone, Debug, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub reference: OrderReference,
    pub customer: CustomerSnapshot,
    pub items: Vec<LineItem>,
    pub total: Money,
    pub payment_method: PaymentProvider,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)] pub struct CustomerSnapshot { pub name: String, pub phone: PhoneNumber, pub email: Option<String>, pub address: String }
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)] pub struct LineItem { pub item_id: i64, pub quantity: u32, pub unit_price: Decimal, pub line_total: Decimal }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { #[default] PaymentPending, Confirmed, Processing, Completed, Cancelled }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus { #[default] Pending, Paid, Failed, Refunded }

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentPending => "payment_pending",
            Self::Confirmed => "confirmed",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment_pending" => Some(Self::PaymentPending),
            "confirmed" => Some(Self::Confirmed),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Completed | Self::Cancelled) }

    /// payment_pending -> confirmed | cancelled
    /// confirmed -> processing | cancelled
    /// processing -> completed | cancelled
    pub fn can_transition(&self, to: OrderStatus) -> bool {
        match (self, to) {
            (Self::PaymentPending, Self::Confirmed) => true,
            (Self::Confirmed, Self::Processing) => true,
            (Self::Processing, Self::Completed) => true,
            (from, Self::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Paid => "paid", Self::Failed => "failed", Self::Refunded => "refunded" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s { "pending" => Some(Self::Pending), "paid" => Some(Self::Paid), "failed" => Some(Self::Failed), "refunded" => Some(Self::Refunded), _ => None }
    }
}

impl LineItem {
    /// None when the line total does not fit a `Decimal`.
    pub fn new(item_id: i64, quantity: u32, unit_price: Decimal) -> Option<Self> {
        let line_total = unit_price.checked_mul(Decimal::from(quantity))?;
        Some(Self { item_id, quantity, unit_price, line_total })
    }
}

impl Order {
    pub fn create(
        reference: OrderReference,
        customer: CustomerSnapshot,
        items: Vec<LineItem>,
        currency: &str,
        payment_method: PaymentProvider,
    ) -> Result<Self, MoneyError> {
        let now = Utc::now();
        let total = items.iter().try_fold(Money::zero(currency), |acc, i| acc.add(&Money::new(i.line_total, currency)))?;
        Ok(Self {
            id: Uuid::now_v7(), reference, customer, items, total, payment_method,
            status: OrderStatus::PaymentPending, payment_status: PaymentStatus::Pending,
            notes: vec![], created_at: now, updated_at: now, completed_at: None,
        })
    }

    pub fn confirm_payment(&mut self, note: impl Into<String>) -> Result<(), OrderError> {
        self.transition(OrderStatus::Confirmed)?;
        self.payment_status = PaymentStatus::Paid;
        self.add_note(note);
        Ok(())
    }

    pub fn fail_payment(&mut self, note: impl Into<String>) -> Result<(), OrderError> {
        if self.status != OrderStatus::PaymentPending { return Err(self.invalid(OrderStatus::Cancelled)); }
        self.transition(OrderStatus::Cancelled)?;
        self.payment_status = PaymentStatus::Failed;
        self.add_note(note);
        Ok(())
    }

    /// Cancels a non-terminal order. A paid order is flagged for refund.
    pub fn cancel(&mut self, note: impl Into<String>) -> Result<(), OrderError> {
        self.transition(OrderStatus::Cancelled)?;
        self.payment_status = match self.payment_status {
            PaymentStatus::Paid => PaymentStatus::Refunded,
            _ => PaymentStatus::Failed,
        };
        self.add_note(note);
        Ok(())
    }

    /// Staff workflow: confirmed -> processing -> completed.
    pub fn advance(&mut self, to: OrderStatus) -> Result<(), OrderError> {
        if !matches!(to, OrderStatus::Processing | OrderStatus::Completed) { return Err(self.invalid(to)); }
        self.transition(to)?;
        if to == OrderStatus::Completed { self.completed_at = Some(self.updated_at); }
        self.add_note(format!("Status changed to {to}"));
        Ok(())
    }

    pub fn add_note(&mut self, note: impl Into<String>) { self.notes.push(note.into()); self.touch(); }

    fn transition(&mut self, to: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition(to) { return Err(self.invalid(to)); }
        self.status = to;
        self.touch();
        Ok(())
    }

    fn invalid(&self, to: OrderStatus) -> OrderError { OrderError::InvalidTransition { from: self.status, to } }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum OrderError { InvalidTransition { from: OrderStatus, to: OrderStatus } }
impl std::error::Error for OrderError {}
impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { Self::InvalidTransition { from, to } => write!(f, "Cannot move order from {from} to {to}") }
    }
}
