//! HTTP surface.

use axum::{routing::{get, post}, Json, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use crate::orchestrator::Orchestrator;

pub mod error;
mod handlers;

pub use error::ErrorBody;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    use error::method_not_allowed as not_allowed;
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "pharmacy-checkout"})) }))
        .route("/api/v1/orders", post(handlers::place_order).fallback(not_allowed))
        .route("/api/v1/orders/:reference", get(handlers::get_order).fallback(not_allowed))
        .route("/api/v1/orders/:reference/cancel", post(handlers::cancel_order).fallback(not_allowed))
        .route("/api/v1/orders/:reference/refund", post(handlers::refund_order).fallback(not_allowed))
        .route("/api/v1/orders/:reference/status", post(handlers::advance_order).fallback(not_allowed))
        .route("/api/v1/payments/status", post(handlers::payment_status).fallback(not_allowed))
        .route("/api/v1/payments/cash", post(handlers::confirm_cash).fallback(not_allowed))
        .route("/api/v1/payments/callback/mpesa", post(handlers::mpesa_callback).fallback(not_allowed))
        .route("/api/v1/payments/callback/paypal", post(handlers::paypal_callback).fallback(not_allowed))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
