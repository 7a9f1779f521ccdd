//! M-Pesa Daraja STK push client.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, instrument, warn};
use crate::config::{MpesaConfig, MpesaEnvironment};
use crate::domain::aggregates::PaymentProvider;
use crate::domain::value_objects::Money;
use super::simulation::{self, TokenCheck, SimulationConfig};
use super::{code_of, rejected, GatewayError, InitiateRequest, Initiated, PaymentGateway, ProviderOutcome, StatusReport};

const PROVIDER: PaymentProvider = PaymentProvider::Mpesa;

/// Daraja's answer to a query for a push the customer has not acted on yet.
const STILL_PROCESSING: &str = "500.001.1001";

/// Maps a Daraja `ResultCode`; shared by the query and callback paths.
pub fn outcome_for_result_code(code: i64) -> ProviderOutcome {
    match code {
        0 => ProviderOutcome::Success,
        1032 => ProviderOutcome::Cancelled,
        4999 => ProviderOutcome::Pending,
        _ => ProviderOutcome::Failure,
    }
}

#[derive(Deserialize)]
struct TokenResponse { access_token: String }

struct Credentials<'a> { key: &'a str, secret: &'a str, shortcode: &'a str, passkey: &'a str }

pub struct MpesaGateway {
    config: MpesaConfig,
    http: reqwest::Client,
    simulation_delay: Duration,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig, http: reqwest::Client, simulation_delay: Duration) -> Self {
        Self { config, http, simulation_delay }
    }

    fn simulation(&self) -> SimulationConfig {
        let c = &self.config;
        SimulationConfig {
            test_mode: c.environment == MpesaEnvironment::Test,
            credentials_present: [&c.consumer_key, &c.consumer_secret, &c.shortcode, &c.passkey]
                .iter()
                .all(|v| simulation::credential_present(v.as_deref())),
            allow_fallback: c.allow_simulation_fallback,
        }
    }

    fn credentials(&self) -> Result<Credentials<'_>, GatewayError> {
        let c = &self.config;
        match (c.consumer_key.as_deref(), c.consumer_secret.as_deref(), c.shortcode.as_deref(), c.passkey.as_deref()) {
            (Some(key), Some(secret), Some(shortcode), Some(passkey)) => Ok(Credentials { key, secret, shortcode, passkey }),
            _ => Err(GatewayError::Rejected { provider: PROVIDER, status: None, message: "M-Pesa credentials are not configured".into() }),
        }
    }

    fn url(&self, path: &str) -> String { format!("{}{path}", self.config.base_url.trim_end_matches('/')) }

    /// Fresh client-credentials token; not cached.
    async fn token(&self, creds: &Credentials<'_>) -> Result<String, GatewayError> {
        let response = self
            .http
            .get(self.url("/oauth/v1/generate"))
            .query(&[("grant_type", "client_credentials")])
            .basic_auth(creds.key, Some(creds.secret))
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
        if !response.status().is_success() { return Err(rejected(PROVIDER, response).await); }
        let token: TokenResponse = response.json().await.map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
        Ok(token.access_token)
    }

    async fn simulate(&self, request: &InitiateRequest) -> Initiated {
        simulation::pause(self.simulation_delay).await;
        let handle = simulation::simulated_handle("MPESA", &request.order_reference);
        warn!(event = "SimulatedPayment", provider = %PROVIDER, handle = %handle, "M-Pesa payment simulated");
        let charged = Money::new(request.amount.whole_units(), request.amount.currency());
        Initiated {
            raw: json!({ "simulated": true, "CheckoutRequestID": handle, "ResponseCode": "0" }),
            handle,
            approval_url: None,
            charged,
            simulated: true,
        }
    }
}

/// `base64(shortcode + passkey + timestamp)`
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{shortcode}{passkey}{timestamp}"))
}

/// `YYYYMMDDHHmmss` in East Africa Time, as Daraja expects.
fn timestamp() -> String {
    (Utc::now() + chrono::Duration::hours(3)).format("%Y%m%d%H%M%S").to_string()
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    fn provider(&self) -> PaymentProvider { PROVIDER }

    #[instrument(skip_all, fields(order = %request.order_reference))]
    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError> {
        let sim = self.simulation();
        if simulation::should_simulate(&sim, TokenCheck::NotAttempted) { return Ok(self.simulate(request).await); }

        let creds = self.credentials()?;
        let token = match self.token(&creds).await {
            Ok(token) => token,
            Err(GatewayError::Rejected { status: Some(status), message, .. }) if simulation::should_simulate(&sim, TokenCheck::Rejected(status)) => {
                warn!(status, %message, "M-Pesa token rejected, falling back to simulation");
                return Ok(self.simulate(request).await);
            }
            Err(e) => return Err(e),
        };
        let callback_url = self.config.callback_url.as_deref().ok_or_else(|| GatewayError::Rejected {
            provider: PROVIDER,
            status: None,
            message: "M-Pesa callback URL is not configured".into(),
        })?;

        let amount = request.amount.whole_units();
        let whole = amount.to_i64().ok_or_else(|| GatewayError::Rejected { provider: PROVIDER, status: None, message: format!("amount {amount} out of range") })?;
        let ts = timestamp();
        let body = json!({
            "BusinessShortCode": creds.shortcode,
            "Password": stk_password(creds.shortcode, creds.passkey, &ts),
            "Timestamp": ts,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": whole,
            "PartyA": request.phone.as_str(),
            "PartyB": creds.shortcode,
            "PhoneNumber": request.phone.as_str(),
            "CallBackURL": callback_url,
            "AccountReference": request.order_reference,
            "TransactionDesc": request.description,
        });

        let response = self
            .http
            .post(self.url("/mpesa/stkpush/v1/processrequest"))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
        if !response.status().is_success() { return Err(rejected(PROVIDER, response).await); }
        let raw: Value = response.json().await.map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;

        if raw.get("ResponseCode").and_then(code_of) != Some(0) {
            let message = raw.get("ResponseDescription").or_else(|| raw.get("errorMessage")).and_then(Value::as_str).unwrap_or("STK push not accepted");
            return Err(GatewayError::Rejected { provider: PROVIDER, status: None, message: message.to_string() });
        }
        let handle = raw
            .get("CheckoutRequestID")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Decode { provider: PROVIDER, message: "missing CheckoutRequestID".into() })?
            .to_string();

        info!(handle = %handle, "STK push accepted");
        Ok(Initiated { handle, approval_url: None, charged: Money::new(amount, request.amount.currency()), raw, simulated: false })
    }

    #[instrument(skip(self))]
    async fn query_status(&self, handle: &str) -> Result<StatusReport, GatewayError> {
        if simulation::is_simulated(handle) {
            return Ok(StatusReport {
                outcome: ProviderOutcome::Success,
                receipt: Some(simulation::simulated_receipt(handle)),
                reason: None,
                raw: json!({ "simulated": true, "ResultCode": 0, "CheckoutRequestID": handle }),
                simulated: true,
            });
        }

        let creds = self.credentials()?;
        let token = self.token(&creds).await?;
        let ts = timestamp();
        let response = self
            .http
            .post(self.url("/mpesa/stkpushquery/v1/query"))
            .bearer_auth(&token)
            .json(&json!({
                "BusinessShortCode": creds.shortcode,
                "Password": stk_password(creds.shortcode, creds.passkey, &ts),
                "Timestamp": ts,
                "CheckoutRequestID": handle,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;

        let status = response.status();
        let raw: Value = response.json().await.map_err(|e| GatewayError::from_reqwest(PROVIDER, e))?;
        if raw.get("errorCode").and_then(Value::as_str) == Some(STILL_PROCESSING) {
            return Ok(StatusReport { outcome: ProviderOutcome::Pending, receipt: None, reason: None, raw, simulated: false });
        }
        if !status.is_success() {
            let message = raw.get("errorMessage").and_then(Value::as_str).unwrap_or("status query failed").to_string();
            return Err(GatewayError::Rejected { provider: PROVIDER, status: Some(status.as_u16()), message });
        }

        let outcome = raw.get("ResultCode").and_then(code_of).map(outcome_for_result_code).unwrap_or(ProviderOutcome::Pending);
        let reason = match outcome {
            ProviderOutcome::Failure | ProviderOutcome::Cancelled => raw.get("ResultDesc").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        Ok(StatusReport { outcome, receipt: None, reason, raw, simulated: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::PhoneNumber;
    use crate::gateway::{http_client, testing};
    use axum::{http::StatusCode, routing::{get, post}, Json, Router};
    use rust_decimal::Decimal;

    fn config(base_url: String) -> MpesaConfig {
        MpesaConfig {
            environment: MpesaEnvironment::Sandbox,
            base_url,
            consumer_key: Some("ck".into()),
            consumer_secret: Some("cs".into()),
            shortcode: Some("174379".into()),
            passkey: Some("pk".into()),
            callback_url: Some("https://shop.example/api/v1/payments/callback/mpesa".into()),
            allow_simulation_fallback: false,
        }
    }

    fn request() -> InitiateRequest {
        InitiateRequest {
            order_reference: "ORD20240101ABCDEF".into(),
            phone: PhoneNumber::parse("0712345678").unwrap(),
            amount: Money::new(Decimal::new(25050, 2), "KES"),
            description: "Pharmacy order".into(),
        }
    }

    fn gateway(config: MpesaConfig) -> MpesaGateway {
        MpesaGateway::new(config, http_client(Duration::from_millis(300)).unwrap(), Duration::ZERO)
    }

    async fn push(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let ts = body["Timestamp"].as_str().unwrap_or_default();
        let expected = stk_password("174379", "pk", ts);
        if body["Password"] != json!(expected) || body["Amount"] != json!(251) || body["PhoneNumber"] != json!("254712345678") {
            return (StatusCode::BAD_REQUEST, Json(json!({ "errorMessage": "bad request" })));
        }
        (StatusCode::OK, Json(json!({ "CheckoutRequestID": "ws_CO_123", "ResponseCode": "0", "ResponseDescription": "Success" })))
    }

    fn provider() -> Router {
        Router::new()
            .route("/oauth/v1/generate", get(|| async { Json(json!({ "access_token": "tok", "expires_in": "3599" })) }))
            .route("/mpesa/stkpush/v1/processrequest", post(push))
            .route(
                "/mpesa/stkpushquery/v1/query",
                post(|Json(body): Json<Value>| async move {
                    match body["CheckoutRequestID"].as_str() {
                        Some("ws_CO_waiting") => (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(json!({ "errorCode": STILL_PROCESSING, "errorMessage": "The transaction is being processed" })),
                        ),
                        _ => (StatusCode::OK, Json(json!({ "ResponseCode": "0", "ResultCode": "1032", "ResultDesc": "Request cancelled by user" }))),
                    }
                }),
            )
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(outcome_for_result_code(0), ProviderOutcome::Success);
        assert_eq!(outcome_for_result_code(1032), ProviderOutcome::Cancelled);
        assert_eq!(outcome_for_result_code(1037), ProviderOutcome::Failure);
        assert_eq!(outcome_for_result_code(2001), ProviderOutcome::Failure);
    }

    #[test]
    fn test_password_encoding() {
        assert_eq!(stk_password("174379", "pk", "20240101120000"), STANDARD.encode("174379pk20240101120000"));
        assert_eq!(timestamp().len(), 14);
    }

    #[tokio::test]
    async fn test_live_push_and_query() {
        let base = testing::serve(provider()).await;
        let gw = gateway(config(base));
        let initiated = gw.initiate(&request()).await.unwrap();
        assert_eq!(initiated.handle, "ws_CO_123");
        assert_eq!(initiated.charged.amount(), Decimal::from(251));
        assert!(!initiated.simulated);

        let report = gw.query_status("ws_CO_123").await.unwrap();
        assert_eq!(report.outcome, ProviderOutcome::Cancelled);
        assert_eq!(report.reason.as_deref(), Some("Request cancelled by user"));
        assert_eq!(gw.query_status("ws_CO_waiting").await.unwrap().outcome, ProviderOutcome::Pending);
    }

    #[tokio::test]
    async fn test_token_rejection_falls_back_only_when_allowed() {
        let router = Router::new().route("/oauth/v1/generate", get(|| async { (StatusCode::UNAUTHORIZED, Json(json!({ "errorMessage": "Invalid credentials" }))) }));
        let base = testing::serve(router).await;

        let err = gateway(config(base.clone())).initiate(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: Some(401), .. }));

        let initiated = gateway(MpesaConfig { allow_simulation_fallback: true, ..config(base) }).initiate(&request()).await.unwrap();
        assert!(initiated.simulated);
        assert!(simulation::is_simulated(&initiated.handle));
    }

    #[tokio::test]
    async fn test_simulated_handles_never_touch_the_network() {
        let gw = gateway(config("http://127.0.0.1:9".into()));
        let report = gw.query_status("TEST_MPESA_ORD1_1").await.unwrap();
        assert_eq!(report.outcome, ProviderOutcome::Success);
        assert!(report.simulated);

        let test_mode = gateway(MpesaConfig { environment: MpesaEnvironment::Test, ..config("http://127.0.0.1:9".into()) });
        assert!(test_mode.initiate(&request()).await.unwrap().simulated);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let router = Router::new().route(
            "/oauth/v1/generate",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({ "access_token": "tok" }))
            }),
        );
        let base = testing::serve(router).await;
        let err = gateway(config(base)).initiate(&request()).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
