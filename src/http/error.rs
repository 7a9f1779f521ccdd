//! HTTP mapping of [`Error`].

use axum::{http::{HeaderValue, StatusCode}, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use tracing::error;
use crate::Error;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub success: bool,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_reference: Option<String>,
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownTransaction(_) | Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::Datastore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

pub(crate) fn error_response(status: StatusCode, body: ErrorBody) -> Response {
    let code = body.code;
    let mut resp = (status, Json(body)).into_response();
    if let Ok(val) = HeaderValue::from_str(code) {
        resp.headers_mut().insert("X-Error-Code", val);
    }
    resp
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Datastore(e) => {
                error!(error = %e, "datastore failure");
                "Internal server error, please retry".to_string()
            }
            other => other.to_string(),
        };
        let order_reference = match &self {
            Self::Gateway { order_reference, .. } => order_reference.clone(),
            _ => None,
        };
        error_response(status, ErrorBody { success: false, code: self.code(), message, order_reference })
    }
}

pub(crate) async fn method_not_allowed() -> Response {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        ErrorBody { success: false, code: "METHOD_NOT_ALLOWED", message: "Method not allowed".into(), order_reference: None },
    )
}
