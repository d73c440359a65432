use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error taxonomy from spec §7, mapped to HTTP statuses at the handler
/// boundary. Infrastructure failures (pool exhaustion, serialization bugs)
/// stay as `anyhow::Error` and are treated as `Transient`.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Transient(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Transient(e)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Transient(anyhow::Error::from(e))
    }
}

/// Errors surfaced from the payment-capture consumer handler. There is no
/// HTTP response to shape here, so this is a separate, smaller taxonomy
/// from `ApiError`: just enough for the consumer loop to decide ack vs.
/// nack (spec §4.5 step 2: "on decode error, acknowledge and route to a
/// dead-letter queue").
#[derive(Debug)]
pub enum HandlerError {
    Decode(String),
    Transient(anyhow::Error),
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        HandlerError::Transient(e)
    }
}

impl From<sqlx::Error> for HandlerError {
    fn from(e: sqlx::Error) -> Self {
        HandlerError::Transient(anyhow::Error::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Transient(err) => {
                tracing::error!(error = %err, "transient failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "temporarily unavailable, retry".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
