//! Domain events
use rust_decimal::Decimal;
use serde::Serialize;
use crate::domain::aggregates::{Order, OrderStatus, PaymentProvider};

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed { reference: String, total: Decimal, currency: String, provider: PaymentProvider },
    Confirmed { reference: String, receipt: Option<String> },
    Cancelled { reference: String, reason: String },
    StatusChanged { reference: String, status: OrderStatus },
}

impl OrderEvent {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Placed { .. } => "orders.placed",
            Self::Confirmed { .. } => "orders.confirmed",
            Self::Cancelled { .. } => "orders.cancelled",
            Self::StatusChanged { .. } => "orders.status",
        }
    }
}

/// Request for the mailer; templates are rendered on its side.
#[derive(Clone, Debug, Serialize)]
pub struct EmailRequest {
    pub template: &'static str,
    pub to: String,
    pub customer_name: String,
    pub order_reference: String,
    pub total: Decimal,
    pub currency: String,
}

impl EmailRequest {
    pub const SUBJECT: &'static str = "notifications.email";

    /// None when the customer left no email address.
    pub fn for_order(template: &'static str, order: &Order) -> Option<Self> {
        let to = order.customer.email.clone()?;
        Some(Self {
            template,
            to,
            customer_name: order.customer.name.clone(),
            order_reference: order.reference.to_string(),
            total: order.total.amount(),
            currency: order.total.currency().to_string(),
        })
    }
}
