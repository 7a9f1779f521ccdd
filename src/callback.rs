//! Provider callback decoding.
//!
//! Each provider's body decodes into a tagged [`ProviderCallback`]; one
//! adapter per provider turns it into a [`CallbackAction`]. Field-name
//! knowledge stays in this module.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use crate::domain::aggregates::PaymentProvider;
use crate::gateway::{code_of, mpesa, paypal, ProviderOutcome};
use crate::orchestrator::{Orchestrator, PaymentResult};
use crate::Error;

// =============================================================================
// M-Pesa STK callback
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct MpesaCallback {
    #[serde(rename = "Body")]
    body: MpesaBody,
}

#[derive(Debug, Deserialize)]
struct MpesaBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    result_code: Value,
    result_desc: Option<String>,
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: Option<Value>,
}

impl StkCallback {
    fn metadata(&self, name: &str) -> Option<&Value> {
        self.callback_metadata.as_ref()?.items.iter().find(|i| i.name == name)?.value.as_ref()
    }
}

// =============================================================================
// PayPal webhook
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PayPalWebhook {
    event_type: String,
    #[serde(default)]
    resource: Value,
}

// =============================================================================
// Decoding
// =============================================================================

#[derive(Debug)]
pub enum ProviderCallback {
    Mpesa(MpesaCallback),
    Paypal(PayPalWebhook),
}

#[derive(Debug, Clone)]
pub enum CallbackAction {
    Finalize(PaymentResult),
    /// The payer approved a PayPal order; capture it through a status poll.
    Capture { handle: String, order_reference: String },
    Ignore { reason: String },
}

impl ProviderCallback {
    pub fn decode(provider: PaymentProvider, body: &Value) -> Result<Self, serde_json::Error> {
        Ok(match provider {
            PaymentProvider::Paypal => Self::Paypal(PayPalWebhook::deserialize(body)?),
            _ => Self::Mpesa(MpesaCallback::deserialize(body)?),
        })
    }

    pub fn into_action(self, raw: Value) -> CallbackAction {
        match self {
            Self::Mpesa(cb) => from_mpesa(cb.body.stk_callback, raw),
            Self::Paypal(hook) => from_paypal(hook, raw),
        }
    }
}

/// `TransactionDate` is `YYYYMMDDHHmmss` in East Africa Time.
fn mpesa_time(value: &Value) -> Option<DateTime<Utc>> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let local = NaiveDateTime::parse_from_str(&text, "%Y%m%d%H%M%S").ok()?;
    Some((local - Duration::hours(3)).and_utc())
}

fn from_mpesa(cb: StkCallback, raw: Value) -> CallbackAction {
    let Some(code) = code_of(&cb.result_code) else {
        return CallbackAction::Ignore { reason: format!("unreadable ResultCode {}", cb.result_code) };
    };
    let outcome = mpesa::outcome_for_result_code(code);
    let receipt = cb.metadata("MpesaReceiptNumber").and_then(Value::as_str).map(str::to_string);
    let settled_at = cb.metadata("TransactionDate").and_then(mpesa_time);
    let reason = match outcome {
        ProviderOutcome::Success | ProviderOutcome::Pending => None,
        _ => cb.result_desc.clone(),
    };
    CallbackAction::Finalize(PaymentResult { handle: cb.checkout_request_id, outcome, receipt, reason, settled_at, raw })
}

fn from_paypal(hook: PayPalWebhook, raw: Value) -> CallbackAction {
    let resource = &hook.resource;
    let text = |pointer: &str| resource.pointer(pointer).and_then(Value::as_str).map(str::to_string);
    let result = |handle: String, outcome: ProviderOutcome, receipt: Option<String>, reason: Option<String>| {
        let settled_at = text("/create_time").and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|t| t.with_timezone(&Utc));
        CallbackAction::Finalize(PaymentResult { handle, outcome, receipt, reason, settled_at, raw: raw.clone() })
    };

    match hook.event_type.as_str() {
        "PAYMENT.CAPTURE.COMPLETED" | "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => {
            let Some(handle) = text("/supplementary_data/related_ids/order_id") else {
                return CallbackAction::Ignore { reason: format!("{} without related order id", hook.event_type) };
            };
            let status = text("/status").unwrap_or_default();
            let outcome = match hook.event_type.as_str() {
                "PAYMENT.CAPTURE.COMPLETED" => ProviderOutcome::Success,
                _ => match paypal::outcome_for_status(&status) {
                    ProviderOutcome::Success | ProviderOutcome::Pending => ProviderOutcome::Failure,
                    other => other,
                },
            };
            let reason = (outcome != ProviderOutcome::Success).then(|| format!("PayPal capture {}", status.to_ascii_lowercase()));
            result(handle, outcome, text("/id"), reason)
        }
        "CHECKOUT.ORDER.APPROVED" => match (text("/id"), text("/purchase_units/0/reference_id")) {
            (Some(handle), Some(order_reference)) => CallbackAction::Capture { handle, order_reference },
            _ => CallbackAction::Ignore { reason: "approved order without id or reference".into() },
        },
        "CHECKOUT.ORDER.VOIDED" => match text("/id") {
            Some(handle) => result(handle, ProviderOutcome::Cancelled, None, Some("PayPal order voided".into())),
            None => CallbackAction::Ignore { reason: "voided order without id".into() },
        },
        other => CallbackAction::Ignore { reason: format!("unhandled event {other}") },
    }
}

/// The body each provider expects back, whatever happened internally.
pub fn ack(provider: PaymentProvider) -> Value {
    match provider {
        PaymentProvider::Paypal => json!({ "status": "received" }),
        _ => json!({ "ResultCode": 0, "ResultDesc": "Accepted" }),
    }
}

/// Decodes and applies a callback. Never fails: every problem is logged
/// and the provider still gets its acknowledgement.
#[instrument(skip_all, fields(provider = %provider))]
pub async fn receive(orchestrator: &Orchestrator, provider: PaymentProvider, body: Value) -> Value {
    let action = match ProviderCallback::decode(provider, &body) {
        Ok(callback) => callback.into_action(body),
        Err(e) => {
            warn!(error = %e, "malformed callback body");
            return ack(provider);
        }
    };

    let outcome = match action {
        CallbackAction::Finalize(result) => {
            let handle = result.handle.clone();
            orchestrator.finalize_payment(result).await.map(|f| (handle, f.status, f.applied))
        }
        CallbackAction::Capture { handle, order_reference } => {
            orchestrator.poll_status(&handle, &order_reference).await.map(|f| (handle, f.status, f.applied))
        }
        CallbackAction::Ignore { reason } => {
            info!(%reason, "callback ignored");
            return ack(provider);
        }
    };

    match outcome {
        Ok((handle, status, applied)) => info!(%handle, %status, applied, "callback processed"),
        Err(Error::UnknownTransaction(handle)) => warn!(event = "CallbackOrphan", %handle, "callback for unknown transaction"),
        Err(e) => error!(error = %e, "callback processing failed"),
    }
    ack(provider)
}
