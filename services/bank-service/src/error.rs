use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use don_ledger::{LedgerDomainError, TransferError};
use serde_json::json;

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

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Domain(domain) => domain.into(),
            TransferError::Infra(err) => ApiError::Transient(err),
        }
    }
}

impl From<LedgerDomainError> for ApiError {
    fn from(e: LedgerDomainError) -> Self {
        match &e {
            LedgerDomainError::AccountNotFound { .. }
            | LedgerDomainError::TransactionNotFound { .. } => ApiError::NotFound(e.to_string()),
            LedgerDomainError::AlreadyReversed { .. } | LedgerDomainError::NotReversible { .. } => {
                ApiError::Conflict(e.to_string())
            }
            LedgerDomainError::NonPositiveAmount { .. }
            | LedgerDomainError::AmountExceedsMax { .. }
            | LedgerDomainError::SameAccount { .. }
            | LedgerDomainError::AccountNotActive { .. }
            | LedgerDomainError::CurrencyMismatch { .. }
            | LedgerDomainError::InsufficientFunds { .. } => ApiError::Validation(e.to_string()),
        }
    }
}

impl ApiError {
    /// Status and JSON body this error renders as, shared by `IntoResponse`
    /// and by `routes::transfer`, which must cache the exact body a
    /// rejection is about to produce (spec §4.3 step 3: "Any failure → 400
    /// with specific reason, cached") before returning it.
    pub fn status_and_body(&self) -> (StatusCode, serde_json::Value) {
        let (status, message) = match self {
            // Spec §6: both bank endpoints report validation failures as
            // 400, unlike donation-service's 422 — pinned per-service by the
            // HTTP surface table, not a shared convention.
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Transient(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable, retry".to_string())
            }
        };
        (status, json!({ "error": message }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Transient(err) = &self {
            tracing::error!(error = %err, "transient failure");
        }
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}
