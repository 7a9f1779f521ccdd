//! Cash on delivery: no provider, staff record the payment.

use async_trait::async_trait;
use serde_json::json;
use crate::domain::aggregates::PaymentProvider;
use super::{GatewayError, InitiateRequest, Initiated, PaymentGateway, ProviderOutcome, StatusReport};

pub const CASH_PREFIX: &str = "CASH-";

pub fn cash_handle(order_reference: &str) -> String { format!("{CASH_PREFIX}{order_reference}") }

pub struct CashGateway;

#[async_trait]
impl PaymentGateway for CashGateway {
    fn provider(&self) -> PaymentProvider { PaymentProvider::Cash }

    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError> {
        let handle = cash_handle(&request.order_reference);
        Ok(Initiated {
            raw: json!({ "method": "cash_on_delivery", "handle": handle }),
            handle,
            approval_url: None,
            charged: request.amount.clone(),
            simulated: false,
        })
    }

    /// Always pending until staff record the cash.
    async fn query_status(&self, handle: &str) -> Result<StatusReport, GatewayError> {
        Ok(StatusReport { outcome: ProviderOutcome::Pending, receipt: None, reason: None, raw: json!({ "handle": handle }), simulated: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{Money, PhoneNumber};
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_cash_is_pending_until_recorded() {
        let request = InitiateRequest {
            order_reference: "ORD20240101ABCDEF".into(),
            phone: PhoneNumber::parse("0712345678").unwrap(),
            amount: Money::new(Decimal::from(420), "KES"),
            description: "Pharmacy order".into(),
        };
        let initiated = CashGateway.initiate(&request).await.unwrap();
        assert_eq!(initiated.handle, "CASH-ORD20240101ABCDEF");
        assert_eq!(CashGateway.query_status(&initiated.handle).await.unwrap().outcome, ProviderOutcome::Pending);
    }
}
