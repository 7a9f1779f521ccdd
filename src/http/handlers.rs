use axum::{body::Bytes, extract::{rejection::JsonRejection, Path, State}, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::callback;
use crate::domain::aggregates::{Order, OrderStatus, PaymentProvider, PaymentStatus, PaymentTransaction, TransactionStatus};
use crate::orchestrator::{Finalized, OrderRequest, PaymentState};
use crate::{Error, Result};
use super::AppState;

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload.map(|Json(v)| v).map_err(|e| Error::Validation(e.body_text()))
}

#[derive(Debug, Serialize)]
pub struct PlaceOrderResponse {
    pub success: bool,
    pub order_reference: String,
    pub checkout_handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub simulated: bool,
    pub timestamp: DateTime<Utc>,
}

pub(super) async fn place_order(
    State(s): State<AppState>,
    payload: std::result::Result<Json<OrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PlaceOrderResponse>)> {
    let placed = s.orchestrator.place_order(body(payload)?).await?;
    Ok((
        StatusCode::CREATED,
        Json(PlaceOrderResponse {
            success: true,
            order_reference: placed.order_reference,
            checkout_handle: placed.checkout_handle,
            approval_url: placed.approval_url,
            amount: placed.amount,
            currency: placed.currency,
            simulated: placed.simulated,
            timestamp: Utc::now(),
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct PaymentView {
    pub provider: PaymentProvider,
    pub status: TransactionStatus,
    pub checkout_handle: Option<String>,
    pub receipt: Option<String>,
    pub simulated: bool,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub success: bool,
    pub order: Order,
    pub payment: Option<PaymentView>,
}

pub(super) async fn get_order(State(s): State<AppState>, Path(reference): Path<String>) -> Result<Json<OrderResponse>> {
    let (order, payment) = s.orchestrator.order(&reference).await?;
    let payment = payment.map(|p: PaymentTransaction| PaymentView {
        provider: p.provider,
        status: p.status,
        checkout_handle: p.external_reference,
        receipt: p.receipt,
        simulated: p.simulated,
    });
    Ok(Json(OrderResponse { success: true, order, payment }))
}

#[derive(Debug, Serialize)]
pub struct OrderStatusResponse {
    pub success: bool,
    pub order_reference: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
}

impl From<Order> for OrderStatusResponse {
    fn from(o: Order) -> Self {
        Self { success: true, order_reference: o.reference.to_string(), status: o.status, payment_status: o.payment_status }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest { pub reason: Option<String> }

fn cancel_reason(payload: std::result::Result<Json<CancelRequest>, JsonRejection>, default: &str) -> Result<String> {
    // an empty body is a cancel without reason
    let request = match payload {
        Err(JsonRejection::MissingJsonContentType(_)) => CancelRequest::default(),
        other => body(other)?,
    };
    Ok(request.reason.filter(|r| !r.trim().is_empty()).unwrap_or_else(|| default.to_string()))
}

pub(super) async fn cancel_order(
    State(s): State<AppState>,
    Path(reference): Path<String>,
    payload: std::result::Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<OrderStatusResponse>> {
    let reason = cancel_reason(payload, "Cancelled on request")?;
    let order = s.orchestrator.cancel_order(&reference, &reason).await?;
    Ok(Json(order.into()))
}

pub(super) async fn refund_order(
    State(s): State<AppState>,
    Path(reference): Path<String>,
    payload: std::result::Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<OrderStatusResponse>> {
    let reason = cancel_reason(payload, "Cancelled by staff, refund due")?;
    let order = s.orchestrator.refund_order(&reference, &reason).await?;
    Ok(Json(order.into()))
}

#[derive(Debug, Deserialize)]
pub struct AdvanceRequest { pub status: OrderStatus }

pub(super) async fn advance_order(
    State(s): State<AppState>,
    Path(reference): Path<String>,
    payload: std::result::Result<Json<AdvanceRequest>, JsonRejection>,
) -> Result<Json<OrderStatusResponse>> {
    let request = body(payload)?;
    let order = s.orchestrator.advance_order(&reference, request.status).await?;
    Ok(Json(order.into()))
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub success: bool,
    pub status: PaymentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
}

impl From<Finalized> for PaymentStatusResponse {
    fn from(f: Finalized) -> Self {
        let status = f.state();
        Self { success: true, status, transaction_id: f.receipt, amount: (status == PaymentState::Completed).then_some(f.amount) }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest { pub checkout_request_id: String, pub order_reference: String }

pub(super) async fn payment_status(
    State(s): State<AppState>,
    payload: std::result::Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<PaymentStatusResponse>> {
    let request = body(payload)?;
    let finalized = s.orchestrator.poll_status(&request.checkout_request_id, &request.order_reference).await?;
    Ok(Json(finalized.into()))
}

#[derive(Debug, Deserialize)]
pub struct CashRequest { pub order_reference: String, pub receipt: Option<String> }

pub(super) async fn confirm_cash(
    State(s): State<AppState>,
    payload: std::result::Result<Json<CashRequest>, JsonRejection>,
) -> Result<Json<PaymentStatusResponse>> {
    let request = body(payload)?;
    let finalized = s.orchestrator.confirm_cash(&request.order_reference, request.receipt).await?;
    Ok(Json(finalized.into()))
}

/// Providers do not always send a JSON content type, so the raw body is read.
fn callback_body(bytes: &Bytes) -> Value { serde_json::from_slice(bytes).unwrap_or(Value::Null) }

pub(super) async fn mpesa_callback(State(s): State<AppState>, bytes: Bytes) -> Json<Value> {
    Json(callback::receive(&s.orchestrator, PaymentProvider::Mpesa, callback_body(&bytes)).await)
}

pub(super) async fn paypal_callback(State(s): State<AppState>, bytes: Bytes) -> Json<Value> {
    Json(callback::receive(&s.orchestrator, PaymentProvider::Paypal, callback_body(&bytes)).await)
}

#[cfg(test)]
mod tests {
    use crate::domain::aggregates::PaymentProvider;
    use crate::gateway::ProviderOutcome;
    use crate::http::{router, AppState};
    use crate::orchestrator::tests::{orchestrator, stocked_store, FakeGateway, Script};
    use axum::{body::Body, http::{Request, StatusCode}, Router};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let gw = Arc::new(FakeGateway { provider: PaymentProvider::Mpesa, on_initiate: Script::Accept("ws_CO_http"), status: ProviderOutcome::Success });
        router(AppState { orchestrator: Arc::new(orchestrator(stocked_store(), gw)) })
    }

    fn order_body(total: &str) -> String {
        json!({
            "customer": { "name": "Kamau Njoroge", "phone": "+254 712 345 678", "email": "kamau@example.com", "address": "Kenyatta Ave" },
            "items": [{ "id": 1, "quantity": 2, "price": "100.00" }, { "id": 2, "quantity": 1, "price": "50.00" }],
            "total": total,
            "payment_method": "mpesa",
        })
        .to_string()
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<String>) -> (StatusCode, Option<String>, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if body.is_some() { req = req.header("content-type", "application/json"); }
        let req = req.body(body.map(Body::from).unwrap_or_else(Body::empty)).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let code = resp.headers().get("X-Error-Code").map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, code, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_order_lifecycle_over_http() {
        let app = app();
        let (status, _, placed) = send(&app, "POST", "/api/v1/orders", Some(order_body("250.00"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(placed["success"], true);
        assert_eq!(placed["checkout_handle"], "ws_CO_http");
        let reference = placed["order_reference"].as_str().unwrap().to_string();

        let poll = json!({ "checkout_request_id": "ws_CO_http", "order_reference": reference }).to_string();
        let (status, _, polled) = send(&app, "POST", "/api/v1/payments/status", Some(poll)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled["status"], "completed");
        assert_eq!(polled["transaction_id"], "QHX81ZK2");

        let (status, _, order) = send(&app, "GET", &format!("/api/v1/orders/{reference}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["order"]["status"], "confirmed");
        assert_eq!(order["order"]["customer"]["phone"], "254712345678");
        assert_eq!(order["payment"]["status"], "completed");

        let (status, _, advanced) = send(&app, "POST", &format!("/api/v1/orders/{reference}/status"), Some(r#"{"status":"processing"}"#.into())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(advanced["status"], "processing");

        let (status, code, _) = send(&app, "POST", &format!("/api/v1/orders/{reference}/cancel"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code.as_deref(), Some("INVALID_TRANSITION"));

        let (status, _, refunded) = send(&app, "POST", &format!("/api/v1/orders/{reference}/refund"), Some(r#"{"reason":"out of stock at branch"}"#.into())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refunded["status"], "cancelled");
        assert_eq!(refunded["payment_status"], "refunded");
    }

    #[tokio::test]
    async fn test_poll_after_cancel_reads_failed() {
        let app = app();
        let (_, _, placed) = send(&app, "POST", "/api/v1/orders", Some(order_body("250.00"))).await;
        let reference = placed["order_reference"].as_str().unwrap().to_string();

        let (status, _, cancelled) = send(&app, "POST", &format!("/api/v1/orders/{reference}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["payment_status"], "failed");

        let poll = json!({ "checkout_request_id": "ws_CO_http", "order_reference": reference }).to_string();
        let (status, _, polled) = send(&app, "POST", "/api/v1/payments/status", Some(poll)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled["status"], "failed");
        assert!(polled.get("amount").map_or(true, Value::is_null));
    }

    #[tokio::test]
    async fn test_business_errors_carry_codes() {
        let app = app();
        let (status, code, body) = send(&app, "POST", "/api/v1/orders", Some(order_body("251.50"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code.as_deref(), Some("AMOUNT_MISMATCH"));
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "AMOUNT_MISMATCH");

        let (status, code, _) = send(&app, "POST", "/api/v1/orders", Some("{not json".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code.as_deref(), Some("VALIDATION_ERROR"));

        let poll = json!({ "checkout_request_id": "ws_CO_nobody", "order_reference": "ORD1" }).to_string();
        let (status, code, _) = send(&app, "POST", "/api/v1/payments/status", Some(poll)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code.as_deref(), Some("UNKNOWN_TRANSACTION"));

        let (status, code, _) = send(&app, "GET", "/api/v1/orders/ORDMISSING", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code.as_deref(), Some("ORDER_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_wrong_method_is_405_json() {
        let (status, code, body) = send(&app(), "GET", "/api/v1/orders", None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(code.as_deref(), Some("METHOD_NOT_ALLOWED"));
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_callbacks_always_ack() {
        let app = app();
        let (status, _, body) = send(&app, "POST", "/api/v1/payments/callback/mpesa", Some("garbage".into())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ResultCode": 0, "ResultDesc": "Accepted" }));

        let hook = json!({ "event_type": "PAYMENT.CAPTURE.COMPLETED", "resource": { "id": "CAP", "supplementary_data": { "related_ids": { "order_id": "NOPE" } } } });
        let (status, _, body) = send(&app, "POST", "/api/v1/payments/callback/paypal", Some(hook.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "received" }));
    }

    #[tokio::test]
    async fn test_health() {
        let (status, _, body) = send(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }
}
