//! PayPal Orders v2 client.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, instrument, warn};
use crate::config::{PayPalConfig, PayPalEnvironment};
use crate::domain::aggregates::PaymentProvider;
use crate::domain::value_objects::Money;
use super::simulation::{self, TokenCheck, SimulationConfig};
use super::{rejected, GatewayError, InitiateRequest, Initiated, PaymentGateway, ProviderOutcome, StatusReport};

const PROVIDER: PaymentProvider = PaymentProvider::Paypal;

/// Maps an order or capture status; shared by the capture and webhook paths.
pub fn outcome_for_status(status: &str) -> ProviderOutcome {
    match status {
        "COMPLETED" => ProviderOutcome::Success,
        "VOIDED" => ProviderOutcome::Cancelled,
        "DECLINED" | "FAILED" => ProviderOutcome::Failure,
        _ => ProviderOutcome::Pending,
    }
}

/// First capture id of a captured order, used as the receipt.
fn capture_id(order: &Value) -> Option<String> {
    order
        .pointer("/purchase_units/0/payments/captures/0/id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn issue(body: &Value) -> Option<&str> { body.pointer("/details/0/issue").and_then(Value::as_str) }

#[derive(Deserialize)]
struct TokenResponse { access_token: String }

pub struct PayPalGateway {
    config: PayPalConfig,
    http: reqwest::Client,
    simulation_delay: Duration,
}

impl PayPalGateway {
    pub fn new(config: PayPalConfig, http: reqwest::Client, simulation_delay: Duration) -> Self {
        Self { config, http, simulation_delay }
    }

    fn simulation(&self) -> SimulationConfig {
        SimulationConfig {
            test_mode: self.config.environment == PayPalEnvironment::Test,
            credentials_present: simulation::credential_present(self.config.client_id.as_deref())
                && simulation::credential_present(self.config.client_secret.as_deref()),
            allow_fallback: self.config.allow_simulation_fallback,
        }
    }

    fn url(&self, path: &str) -> String { format!("{}{path}", self.config.base_url.trim_end_matches('/')) }

    async fn token(&self) -> Result<String, GatewayError> {
        let (Some(id), Some(secret)) = (self.config.client_id.as_deref(), self.config.client_secret.as_deref()) else {
            return Err(GatewayError::Rejected { provider: PROVIDER, status: None, message: "PayPal credentials are not configured".into() });
        };
        let response = self
            .http
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(id, Some(secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
        if !response.status().is_success() { return Err(rejected(PROVIDER, response).await); }
        let token: TokenResponse = response.json().await.map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
        Ok(token.access_token)
    }

    fn charge(&self, request: &InitiateRequest) -> Result<Money, GatewayError> {
        request.amount.convert(self.config.exchange_rate, &self.config.currency).map_err(|e| GatewayError::Rejected {
            provider: PROVIDER,
            status: None,
            message: format!("Cannot convert {} {}: {e}", request.amount.amount(), request.amount.currency()),
        })
    }

    async fn simulate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError> {
        let charged = self.charge(request)?;
        simulation::pause(self.simulation_delay).await;
        let handle = simulation::simulated_handle("PAYPAL", &request.order_reference);
        warn!(event = "SimulatedPayment", provider = %PROVIDER, handle = %handle, "PayPal payment simulated");
        let approval_url = format!("{}?token={handle}", self.config.return_url);
        Ok(Initiated {
            raw: json!({ "simulated": true, "id": handle, "status": "CREATED" }),
            charged,
            approval_url: Some(approval_url),
            handle,
            simulated: true,
        })
    }

    async fn fetch_order(&self, token: &str, handle: &str) -> Result<Value, GatewayError> {
        let response = self
            .http
            .get(self.url(&format!("/v2/checkout/orders/{handle}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
        if !response.status().is_success() { return Err(rejected(PROVIDER, response).await); }
        response.json().await.map_err(|e| GatewayError::from_reqwest(PROVIDER, e))
    }
}

fn report_for_order(order: Value) -> StatusReport {
    let status = order.get("status").and_then(Value::as_str).unwrap_or_default();
    let capture_status = order.pointer("/purchase_units/0/payments/captures/0/status").and_then(Value::as_str);
    // A completed order can still carry a declined capture.
    let outcome = match (outcome_for_status(status), capture_status.map(outcome_for_status)) {
        (ProviderOutcome::Success, Some(ProviderOutcome::Failure)) => ProviderOutcome::Failure,
        (outcome, _) => outcome,
    };
    let reason = match outcome {
        ProviderOutcome::Failure | ProviderOutcome::Cancelled => Some(format!("PayPal order {}", capture_status.unwrap_or(status))),
        _ => None,
    };
    StatusReport { outcome, receipt: capture_id(&order), reason, raw: order, simulated: false }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn provider(&self) -> PaymentProvider { PROVIDER }

    #[instrument(skip_all, fields(order = %request.order_reference))]
    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError> {
        let sim = self.simulation();
        if simulation::should_simulate(&sim, TokenCheck::NotAttempted) { return self.simulate(request).await; }

        let token = match self.token().await {
            Ok(token) => token,
            Err(GatewayError::Rejected { status: Some(status), message, .. }) if simulation::should_simulate(&sim, TokenCheck::Rejected(status)) => {
                warn!(status, %message, "PayPal token rejected, falling back to simulation");
                return self.simulate(request).await;
            }
            Err(e) => return Err(e),
        };

        let charged = self.charge(request)?;
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_reference,
                "description": request.description,
                "amount": { "currency_code": charged.currency(), "value": format!("{:.2}", charged.amount()) },
            }],
            "application_context": {
                "return_url": self.config.return_url,
                "cancel_url": self.config.cancel_url,
                "user_action": "PAY_NOW",
                "shipping_preference": "NO_SHIPPING",
            },
        });

        let response = self
            .http
            .post(self.url("/v2/checkout/orders"))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
        if !response.status().is_success() { return Err(rejected(PROVIDER, response).await); }
        let raw: Value = response.json().await.map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;

        let handle = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Decode { provider: PROVIDER, message: "missing order id".into() })?
            .to_string();
        let approval_url = raw
            .get("links")
            .and_then(Value::as_array)
            .and_then(|links| links.iter().find(|l| l.get("rel").and_then(Value::as_str) == Some("approve")))
            .and_then(|l| l.get("href").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Decode { provider: PROVIDER, message: "missing approve link".into() })?;

        info!(handle = %handle, "PayPal order created");
        Ok(Initiated { handle, approval_url: Some(approval_url), charged, raw, simulated: false })
    }

    /// Attempts the capture; an unapproved order reports pending.
    #[instrument(skip(self))]
    async fn query_status(&self, handle: &str) -> Result<StatusReport, GatewayError> {
        if simulation::is_simulated(handle) {
            return Ok(StatusReport {
                outcome: ProviderOutcome::Success,
                receipt: Some(simulation::simulated_receipt(handle)),
                reason: None,
                raw: json!({ "simulated": true, "id": handle, "status": "COMPLETED" }),
                simulated: true,
            });
        }

        let token = self.token().await?;
        let response = self
            .http
            .post(self.url(&format!("/v2/checkout/orders/{handle}/capture")))
            .bearer_auth(&token)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;

        let status = response.status();
        if status.is_success() {
            let raw: Value = response.json().await.map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
            return Ok(report_for_order(raw));
        }
        if status.as_u16() != 422 { return Err(rejected(PROVIDER, response).await); }

        let raw: Value = response.json().await.map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
        match issue(&raw) {
            Some("ORDER_NOT_APPROVED") | Some("PAYER_ACTION_REQUIRED") => {
                Ok(StatusReport { outcome: ProviderOutcome::Pending, receipt: None, reason: None, raw, simulated: false })
            }
            Some("ORDER_ALREADY_CAPTURED") => Ok(report_for_order(self.fetch_order(&token, handle).await?)),
            Some(other) => Ok(StatusReport { outcome: ProviderOutcome::Failure, receipt: None, reason: Some(format!("PayPal capture failed: {other}")), raw, simulated: false }),
            None => Err(GatewayError::Decode { provider: PROVIDER, message: "422 without issue".into() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{Money, PhoneNumber};
    use crate::gateway::{http_client, testing};
    use axum::{extract::Path, http::StatusCode, routing::{get, post}, Json, Router};
    use rust_decimal::Decimal;

    fn config(base_url: String) -> PayPalConfig {
        PayPalConfig {
            environment: PayPalEnvironment::Sandbox,
            base_url,
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            return_url: "https://shop.example/paypal/return".into(),
            cancel_url: "https://shop.example/paypal/cancel".into(),
            currency: "USD".into(),
            exchange_rate: Decimal::new(77, 4),
            allow_simulation_fallback: false,
        }
    }

    fn gateway(base_url: String) -> PayPalGateway {
        PayPalGateway::new(config(base_url), http_client(Duration::from_secs(2)).unwrap(), Duration::ZERO)
    }

    fn request() -> InitiateRequest {
        InitiateRequest {
            order_reference: "ORD20240101ABCDEF".into(),
            phone: PhoneNumber::parse("0712345678").unwrap(),
            amount: Money::new(Decimal::from(1000), "KES"),
            description: "Pharmacy order".into(),
        }
    }

    async fn capture(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
        match id.as_str() {
            "WAITING" => (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "name": "UNPROCESSABLE_ENTITY", "details": [{ "issue": "ORDER_NOT_APPROVED" }] }))),
            "DONE" => (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "name": "UNPROCESSABLE_ENTITY", "details": [{ "issue": "ORDER_ALREADY_CAPTURED" }] }))),
            _ => (
                StatusCode::CREATED,
                Json(json!({ "id": id, "status": "COMPLETED", "purchase_units": [{ "payments": { "captures": [{ "id": "CAP-1", "status": "COMPLETED" }] } }] })),
            ),
        }
    }

    fn provider() -> Router {
        Router::new()
            .route("/v1/oauth2/token", post(|| async { Json(json!({ "access_token": "A21", "token_type": "Bearer" })) }))
            .route(
                "/v2/checkout/orders",
                post(|Json(body): Json<Value>| async move {
                    if body.pointer("/purchase_units/0/amount/value") != Some(&json!("7.70")) {
                        return (StatusCode::BAD_REQUEST, Json(json!({ "message": "wrong amount" })));
                    }
                    (StatusCode::CREATED, Json(json!({
                        "id": "5O190127TN364715T",
                        "status": "CREATED",
                        "links": [
                            { "href": "https://api.paypal.com/v2/checkout/orders/5O190127TN364715T", "rel": "self" },
                            { "href": "https://www.paypal.com/checkoutnow?token=5O190127TN364715T", "rel": "approve" },
                        ],
                    })))
                }),
            )
            .route("/v2/checkout/orders/:id/capture", post(capture))
            .route(
                "/v2/checkout/orders/:id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({ "id": id, "status": "COMPLETED", "purchase_units": [{ "payments": { "captures": [{ "id": "CAP-9", "status": "COMPLETED" }] } }] }))
                }),
            )
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(outcome_for_status("COMPLETED"), ProviderOutcome::Success);
        assert_eq!(outcome_for_status("DECLINED"), ProviderOutcome::Failure);
        assert_eq!(outcome_for_status("VOIDED"), ProviderOutcome::Cancelled);
        assert_eq!(outcome_for_status("APPROVED"), ProviderOutcome::Pending);
    }

    #[tokio::test]
    async fn test_create_returns_approve_link_and_converted_amount() {
        let gw = gateway(testing::serve(provider()).await);
        let initiated = gw.initiate(&request()).await.unwrap();
        assert_eq!(initiated.handle, "5O190127TN364715T");
        assert_eq!(initiated.approval_url.as_deref(), Some("https://www.paypal.com/checkoutnow?token=5O190127TN364715T"));
        assert_eq!(initiated.charged.amount(), Decimal::new(770, 2));
        assert_eq!(initiated.charged.currency(), "USD");
    }

    #[tokio::test]
    async fn test_capture_outcomes() {
        let gw = gateway(testing::serve(provider()).await);
        let done = gw.query_status("5O190127TN364715T").await.unwrap();
        assert_eq!(done.outcome, ProviderOutcome::Success);
        assert_eq!(done.receipt.as_deref(), Some("CAP-1"));

        assert_eq!(gw.query_status("WAITING").await.unwrap().outcome, ProviderOutcome::Pending);

        let again = gw.query_status("DONE").await.unwrap();
        assert_eq!(again.outcome, ProviderOutcome::Success);
        assert_eq!(again.receipt.as_deref(), Some("CAP-9"));
    }

    #[tokio::test]
    async fn test_missing_credentials_simulate() {
        let gw = PayPalGateway::new(
            PayPalConfig { client_id: None, ..config("http://127.0.0.1:9".into()) },
            http_client(Duration::from_secs(1)).unwrap(),
            Duration::ZERO,
        );
        let initiated = gw.initiate(&request()).await.unwrap();
        assert!(initiated.simulated);
        assert!(initiated.approval_url.unwrap().contains(&initiated.handle));
        assert_eq!(gw.query_status(&initiated.handle).await.unwrap().outcome, ProviderOutcome::Success);
    }
}
