//! Pharmacy checkout service
//!
//! Order placement and payment reconciliation for a pharmacy storefront.
//!
//! ## Features
//! - Order placement with all-or-nothing stock reservation
//! - M-Pesa STK push, PayPal checkout and cash on delivery
//! - Provider callbacks and status polling settled through one
//!   compare-and-swap finalize path
//! - Cancellation and staff fulfilment workflow with restocking

use rust_decimal::Decimal;
use thiserror::Error;

pub mod callback;
pub mod config;
pub mod domain;
pub mod gateway;
pub mod http;
pub mod notify;
pub mod orchestrator;
pub mod store;

use domain::aggregates::OrderStatus;
use gateway::GatewayError;
use store::StoreError;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("Insufficient stock for {name}: requested {requested}, available {available}")]
    InsufficientStock { item_id: i64, name: String, requested: u32, available: u32 },

    #[error("Order total {declared} does not match the computed total {computed}")]
    AmountMismatch { declared: Decimal, computed: Decimal },

    #[error("Amount {amount} is outside the allowed range {min} to {max}")]
    AmountOutOfRange { amount: Decimal, min: Decimal, max: Decimal },

    #[error("Payment gateway error: {source}")]
    Gateway { #[source] source: GatewayError, order_reference: Option<String> },

    #[error("Unknown payment transaction {0}")]
    UnknownTransaction(String),

    #[error("Order {0} not found")]
    OrderNotFound(String),

    #[error("Cannot move order {reference} from {from} to {to}")]
    InvalidTransition { reference: String, from: OrderStatus, to: OrderStatus },

    #[error("Datastore error: {0}")]
    Datastore(#[source] StoreError),
}

impl Error {
    /// Machine-checkable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Self::AmountOutOfRange { .. } => "AMOUNT_OUT_OF_RANGE",
            Self::Gateway { .. } => "GATEWAY_ERROR",
            Self::UnknownTransaction(_) => "UNKNOWN_TRANSACTION",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Datastore(_) => "DATASTORE_ERROR",
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InsufficientStock { item_id, name, requested, available } => Self::InsufficientStock { item_id, name, requested, available },
            StoreError::UnknownItem(id) => Self::Validation(format!("Unknown item {id}")),
            StoreError::QuantityTooLarge { item_id } => Self::Validation(format!("Quantity of item {item_id} is too large")),
            other => Self::Datastore(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_keep_business_meaning() {
        let e: Error = StoreError::InsufficientStock { item_id: 4, name: "Amoxicillin".into(), requested: 3, available: 1 }.into();
        assert_eq!(e.code(), "INSUFFICIENT_STOCK");
        assert!(e.to_string().contains("Amoxicillin"));
        assert_eq!(Error::from(StoreError::UnknownItem(9)).code(), "VALIDATION_ERROR");
        assert_eq!(Error::from(StoreError::QuantityTooLarge { item_id: 1 }).code(), "VALIDATION_ERROR");
        assert_eq!(Error::from(StoreError::Corrupt("x".into())).code(), "DATASTORE_ERROR");
    }
}
