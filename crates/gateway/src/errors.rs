use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{Value as JsonValue, json};

use courier_core::MessageKind;
use courier_infra::CallError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("unexpected response to {kind}: {response}")]
    UnexpectedResponse { kind: MessageKind, response: JsonValue },
}

/// Callers never see worker or broker detail; it is logged here instead.
impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        match &self {
            GatewayError::Call(CallError::Timeout { queue, ttl }) => {
                tracing::warn!(queue = %queue, ttl_ms = ttl.as_millis() as u64, "worker call timed out");
            }
            other => tracing::error!(error = %other, "worker call failed"),
        }
        internal_error()
    }
}

pub fn internal_error() -> axum::response::Response {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal server error",
    )
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
