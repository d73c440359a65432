use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
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

/// Errors surfaced from the bus-consumer handlers (`consumer::upsert_mirror`,
/// `consumer::invalidate`). Separate from `ApiError` since there is no HTTP
/// response to shape here — just enough for the consumer loop to decide ack
/// vs. nack.
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
            ApiError::Transient(err) => {
                tracing::error!(error = %err, "transient failure");
                (StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable, retry".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
