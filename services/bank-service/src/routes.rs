use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use don_idempotency::{CachedResponse, IdempotencyOutcome};
use don_ledger::{LedgerDomainError, TransferRequest};
use don_money::Cents;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{AccountResponse, AccountRow, OpenAccountRequest, TransferRequestBody, TransferResponse};
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/bank/accounts", post(open_account))
        .route("/bank/accounts/:id", get(get_account))
        .route("/bank/transfers", post(transfer))
        .route("/bank/transfers/:id/reverse", post(reverse));

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiError> {
    don_db::ping(&state.pool).await?;
    Ok("ok")
}

/// Opens a new account for `owner_ref`. Spec §6: 400 if the owner already
/// has one — `owner_ref` carries a unique constraint, so the duplicate
/// check is a single insert-conflict rather than a separate lookup.
async fn open_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), ApiError> {
    if req.holder_name.trim().is_empty() {
        return Err(ApiError::Validation("holder_name is required".into()));
    }
    let opening_balance = req.opening_balance_cents.unwrap_or(0);
    if opening_balance < 0 {
        return Err(ApiError::Validation("opening_balance_cents must be >= 0".into()));
    }

    let account_id = Uuid::new_v4();
    let account_number = generate_account_number();

    let row = sqlx::query_as::<_, AccountRow>(
        r#"
        INSERT INTO accounts
            (account_id, owner_ref, account_number, holder_name, contact, balance_cents, currency, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'active')
        RETURNING account_id, owner_ref, account_number, holder_name, contact, balance_cents,
                  currency, status, version, created_at, updated_at
        "#,
    )
    .bind(account_id)
    .bind(req.owner_ref)
    .bind(&account_number)
    .bind(&req.holder_name)
    .bind(&req.contact)
    .bind(opening_balance)
    .bind(&req.currency)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| {
        if don_db::is_unique_violation(&e, "accounts_owner_ref_key") {
            ApiError::Validation(format!("owner {} already has an account", req.owner_ref))
        } else {
            ApiError::from(e)
        }
    })?;

    tracing::info!(account_id = %row.account_id, account_number = %row.account_number, "account opened");

    Ok((StatusCode::CREATED, Json(row.into())))
}

async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AccountResponse>, ApiError> {
    let row = sqlx::query_as::<_, AccountRow>(
        r#"
        SELECT account_id, owner_ref, account_number, holder_name, contact, balance_cents,
               currency, status, version, created_at, updated_at
        FROM accounts WHERE account_id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("account {id} not found")))?;

    Ok(Json(row.into()))
}

/// Peer-to-peer transfer, spec §4.3. Idempotency is handled at this layer
/// (derive key, reserve, replay) while `don_ledger::execute_transfer` itself
/// also recognizes a repeated `idempotency_key` at the database level — the
/// two are complementary: the guard short-circuits repeat HTTP deliveries
/// before they touch the ledger at all, the ledger's own check covers a
/// retry that arrives with a new HTTP request object but the same key.
async fn transfer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let req: TransferRequestBody =
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(format!("invalid transfer body: {e}")))?;

    let header_key = headers.get("X-Idempotency-Key").and_then(|v| v.to_str().ok());
    let key = don_idempotency::derive_key(header_key, &body);

    let mut guard = state.idempotency.lock().await;
    match guard.check_and_reserve(&state.pool, &key).await? {
        IdempotencyOutcome::Duplicate(Some(cached)) => {
            let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
            return Ok((status, Json(cached.body)));
        }
        IdempotencyOutcome::Duplicate(None) => {
            return Err(ApiError::Conflict(
                "request with this idempotency key is already being processed".into(),
            ));
        }
        IdempotencyOutcome::New => {}
    }

    let validation_err = if req.amount_cents <= 0 {
        Some(ApiError::from(LedgerDomainError::NonPositiveAmount { amount_cents: req.amount_cents }))
    } else {
        None
    };

    let outcome = match validation_err {
        Some(err) => Err(err),
        None => don_ledger::execute_transfer(
            &state.pool,
            &TransferRequest {
                idempotency_key: key.clone(),
                from_account_number: req.from_account_number,
                to_account_number: req.to_account_number,
                amount: Cents::new(req.amount_cents),
                currency: req.currency,
                max_transfer: Cents::new(state.settings.max_transfer_cents),
            },
        )
        .await
        .map_err(ApiError::from),
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        // Transient (db/infra) failures are never cached — spec §7: "Surfaced
        // as 5xx ... safe to retry." Every other rejection is a final,
        // deterministic answer for this key and must replay verbatim on
        // retry, so it is cached here before the `Err` return, the same way
        // a success is cached below.
        Err(ApiError::Transient(err)) => return Err(ApiError::Transient(err)),
        Err(err) => {
            let (status, body) = err.status_and_body();
            guard
                .complete(&state.pool, &key, &CachedResponse { status: status.as_u16(), body })
                .await?;
            return Err(err);
        }
    };

    if outcome.newly_executed {
        tracing::info!(transaction_id = %outcome.transaction_id, "transfer executed");
    }

    let response = TransferResponse {
        transaction_id: outcome.transaction_id,
        from_account_number: outcome.from_account_number,
        to_account_number: outcome.to_account_number,
        amount: outcome.amount.to_string(),
        from_balance: outcome.from_balance_after.to_string(),
        to_balance: outcome.to_balance_after.to_string(),
    };
    let body = serde_json::to_value(&response).map_err(anyhow::Error::from)?;

    guard
        .complete(&state.pool, &key, &CachedResponse { status: 201, body: body.clone() })
        .await?;

    Ok((StatusCode::CREATED, Json(body)))
}

/// Reverses a completed transfer. Not named in the endpoint table but
/// required by the reversal contract in spec §4.3 — exposed the same way
/// the refund flow is exposed for payments.
async fn reverse(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransferResponse>, ApiError> {
    let idempotency_key = format!("reversal:{id}");
    let outcome = don_ledger::reverse_transfer(
        &state.pool,
        id,
        &idempotency_key,
        Cents::new(state.settings.max_transfer_cents),
    )
    .await?;

    tracing::info!(original_transaction_id = %id, reversal_transaction_id = %outcome.transaction_id, "transfer reversed");

    Ok(Json(TransferResponse {
        transaction_id: outcome.transaction_id,
        from_account_number: outcome.from_account_number,
        to_account_number: outcome.to_account_number,
        amount: outcome.amount.to_string(),
        from_balance: outcome.from_balance_after.to_string(),
        to_balance: outcome.to_balance_after.to_string(),
    }))
}

fn generate_account_number() -> String {
    format!("ACC-{}", &Uuid::new_v4().simple().to_string()[..12].to_uppercase())
}
