//! Payment provider clients.
//!
//! Each provider implements [`PaymentGateway`]; the orchestrator picks one
//! through [`Gateways`] by the order's payment method.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use crate::domain::aggregates::PaymentProvider;
use crate::domain::value_objects::{Money, PhoneNumber};

pub mod cash;
pub mod mpesa;
pub mod paypal;
pub mod simulation;

pub use cash::CashGateway;
pub use mpesa::MpesaGateway;
pub use paypal::PayPalGateway;

#[derive(Clone, Debug)]
pub struct InitiateRequest {
    pub order_reference: String,
    pub phone: PhoneNumber,
    pub amount: Money,
    pub description: String,
}

#[derive(Clone, Debug)]
pub struct Initiated {
    pub handle: String,
    pub approval_url: Option<String>,
    /// What the provider will actually charge, after rounding or conversion.
    pub charged: Money,
    pub raw: Value,
    pub simulated: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderOutcome { Success, Failure, Cancelled, Pending }

impl ProviderOutcome {
    pub fn is_terminal(&self) -> bool { !matches!(self, Self::Pending) }
}

#[derive(Clone, Debug)]
pub struct StatusReport {
    pub outcome: ProviderOutcome,
    pub receipt: Option<String>,
    pub reason: Option<String>,
    pub raw: Value,
    pub simulated: bool,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{provider} did not answer in time")]
    Timeout { provider: PaymentProvider },

    #[error("{provider} rejected the request: {message}")]
    Rejected { provider: PaymentProvider, status: Option<u16>, message: String },

    #[error("{provider} could not be reached: {source}")]
    Transport { provider: PaymentProvider, #[source] source: reqwest::Error },

    #[error("Unexpected {provider} response: {message}")]
    Decode { provider: PaymentProvider, message: String },
}

impl GatewayError {
    pub(crate) fn from_reqwest(provider: PaymentProvider, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout { provider }
        } else if e.is_decode() {
            Self::Decode { provider, message: e.to_string() }
        } else {
            Self::Transport { provider, source: e }
        }
    }

    pub fn is_timeout(&self) -> bool { matches!(self, Self::Timeout { .. }) }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError>;

    async fn query_status(&self, handle: &str) -> Result<StatusReport, GatewayError>;
}

/// Gateways by provider.
#[derive(Clone, Default)]
pub struct Gateways {
    by_provider: HashMap<PaymentProvider, Arc<dyn PaymentGateway>>,
}

impl Gateways {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.by_provider.insert(gateway.provider(), gateway);
        self
    }

    pub fn get(&self, provider: PaymentProvider) -> Option<Arc<dyn PaymentGateway>> {
        self.by_provider.get(&provider).cloned()
    }
}

/// Shared HTTP client with the bounded gateway timeout.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}

/// Reads a JSON code that providers send either as a number or a string.
pub(crate) fn code_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Turns a non-2xx response into `Rejected`, keeping the provider's message.
pub(crate) async fn rejected(provider: PaymentProvider, response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            ["errorMessage", "error_description", "message", "ResponseDescription"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| format!("HTTP {status}"));
    GatewayError::Rejected { provider, status: Some(status), message }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process stand-in for a provider's REST API.
    use axum::Router;
    use std::net::SocketAddr;

    pub async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_code_of_accepts_numbers_and_strings() {
        assert_eq!(code_of(&json!(0)), Some(0));
        assert_eq!(code_of(&json!("1032")), Some(1032));
        assert_eq!(code_of(&json!(null)), None);
    }

    #[test]
    fn test_registry_lookup() {
        let gateways = Gateways::new().with(Arc::new(CashGateway));
        assert!(gateways.get(PaymentProvider::Cash).is_some());
        assert!(gateways.get(PaymentProvider::Mpesa).is_none());
    }
}
