//! Peer-to-peer transfer execution.
//!
//! Schema this module assumes (see `bank-service/migrations/0001_init.sql`):
//!
//! ```sql
//! CREATE TABLE accounts (
//!     account_id      UUID PRIMARY KEY,
//!     account_number  TEXT UNIQUE NOT NULL,
//!     owner_name      TEXT NOT NULL,
//!     currency        TEXT NOT NULL,
//!     balance_cents   BIGINT NOT NULL,
//!     status          TEXT NOT NULL DEFAULT 'active',
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//!
//! CREATE TABLE transactions (
//!     transaction_id   UUID PRIMARY KEY,
//!     idempotency_key  TEXT UNIQUE NOT NULL,
//!     from_account_id  UUID NOT NULL REFERENCES accounts(account_id),
//!     to_account_id    UUID NOT NULL REFERENCES accounts(account_id),
//!     amount_cents     BIGINT NOT NULL,
//!     currency         TEXT NOT NULL,
//!     kind             TEXT NOT NULL DEFAULT 'transfer',
//!     reversal_of      UUID REFERENCES transactions(transaction_id),
//!     created_at       TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//!
//! CREATE TABLE ledger_entries (
//!     entry_id             UUID PRIMARY KEY,
//!     transaction_id       UUID NOT NULL REFERENCES transactions(transaction_id),
//!     account_id           UUID NOT NULL REFERENCES accounts(account_id),
//!     direction            TEXT NOT NULL,
//!     amount_cents         BIGINT NOT NULL,
//!     balance_after_cents  BIGINT NOT NULL,
//!     created_at           TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```

use std::fmt;

use don_money::Cents;
use don_outbox::NewOutboxRecord;
use sqlx::PgPool;
use uuid::Uuid;

/// Domain-level rejections: the request was well-formed but cannot be
/// executed given current ledger state. Distinguished from `anyhow::Error`
/// (connection/IO failures) so callers can map each variant to the right
/// HTTP status instead of a blanket 500.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerDomainError {
    NonPositiveAmount { amount_cents: i64 },
    AmountExceedsMax { amount_cents: i64, max_cents: i64 },
    SameAccount { account_number: String },
    AccountNotFound { account_number: String },
    AccountNotActive { account_number: String, status: String },
    CurrencyMismatch { expected: String, actual: String },
    InsufficientFunds { account_number: String, balance_cents: i64, requested_cents: i64 },
    TransactionNotFound { transaction_id: Uuid },
    AlreadyReversed { transaction_id: Uuid },
    NotReversible { transaction_id: Uuid, kind: String },
}

impl fmt::Display for LedgerDomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerDomainError::NonPositiveAmount { amount_cents } => {
                write!(f, "transfer amount must be positive, got {amount_cents}")
            }
            LedgerDomainError::AmountExceedsMax { amount_cents, max_cents } => {
                write!(f, "transfer amount {amount_cents} exceeds MAX_TRANSFER {max_cents}")
            }
            LedgerDomainError::SameAccount { account_number } => {
                write!(f, "cannot transfer account {account_number} to itself")
            }
            LedgerDomainError::AccountNotFound { account_number } => {
                write!(f, "account {account_number} not found")
            }
            LedgerDomainError::AccountNotActive { account_number, status } => {
                write!(f, "account {account_number} is {status}, not active")
            }
            LedgerDomainError::CurrencyMismatch { expected, actual } => {
                write!(f, "currency mismatch: expected {expected}, got {actual}")
            }
            LedgerDomainError::InsufficientFunds { account_number, balance_cents, requested_cents } => {
                write!(
                    f,
                    "account {account_number} balance {balance_cents} insufficient for {requested_cents}"
                )
            }
            LedgerDomainError::TransactionNotFound { transaction_id } => {
                write!(f, "transaction {transaction_id} not found")
            }
            LedgerDomainError::AlreadyReversed { transaction_id } => {
                write!(f, "transaction {transaction_id} already reversed")
            }
            LedgerDomainError::NotReversible { transaction_id, kind } => {
                write!(f, "transaction {transaction_id} is a {kind}, only a completed transfer can be reversed")
            }
        }
    }
}

impl std::error::Error for LedgerDomainError {}

/// Either a domain rejection or an infrastructure failure (pool exhaustion,
/// connection loss). Infra failures use `anyhow::Error` so `.context()`
/// chains through exactly the way the rest of the workspace propagates them.
#[derive(Debug)]
pub enum TransferError {
    Domain(LedgerDomainError),
    Infra(anyhow::Error),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Domain(e) => write!(f, "{e}"),
            TransferError::Infra(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<LedgerDomainError> for TransferError {
    fn from(e: LedgerDomainError) -> Self {
        TransferError::Domain(e)
    }
}

impl From<anyhow::Error> for TransferError {
    fn from(e: anyhow::Error) -> Self {
        TransferError::Infra(e)
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::Infra(anyhow::Error::from(e).context("ledger db operation failed"))
    }
}

pub struct TransferRequest {
    pub idempotency_key: String,
    pub from_account_number: String,
    pub to_account_number: String,
    pub amount: Cents,
    pub currency: String,
    /// Spec §6 `MAX_TRANSFER` limit, in cents, as configured by the calling
    /// service. Carried per-request rather than baked into this crate so
    /// the limit stays a caller-owned config knob.
    pub max_transfer: Cents,
}

pub struct TransferOutcome {
    pub transaction_id: Uuid,
    pub from_account_number: String,
    pub to_account_number: String,
    pub amount: Cents,
    pub from_balance_after: Cents,
    pub to_balance_after: Cents,
    /// `true` only the first time this idempotency key was executed; a
    /// retried request that hits the existing row returns `false` alongside
    /// the same `transaction_id` and balances as the original execution.
    pub newly_executed: bool,
}

struct AccountRow {
    account_id: Uuid,
    account_number: String,
    currency: String,
    balance_cents: i64,
    status: String,
}

/// Executes a peer-to-peer transfer with the 8-step algorithm from spec
/// §4.3: validate, check idempotency, lock accounts in deterministic order,
/// validate account state and balance, debit/credit, write double-entry
/// rows, write the transaction record, and enqueue the downstream event in
/// the same transaction the balances change in.
pub async fn execute_transfer(
    pool: &PgPool,
    req: &TransferRequest,
) -> Result<TransferOutcome, TransferError> {
    let mut tx = pool.begin().await?;
    let outcome = execute_transfer_locked(&mut tx, req, None).await?;
    tx.commit().await?;

    Ok(outcome)
}

fn validate_request(req: &TransferRequest) -> Result<(), LedgerDomainError> {
    if !req.amount.is_positive() {
        return Err(LedgerDomainError::NonPositiveAmount {
            amount_cents: req.amount.raw(),
        });
    }
    if req.from_account_number == req.to_account_number {
        return Err(LedgerDomainError::SameAccount {
            account_number: req.from_account_number.clone(),
        });
    }
    if req.amount.raw() > req.max_transfer.raw() {
        return Err(LedgerDomainError::AmountExceedsMax {
            amount_cents: req.amount.raw(),
            max_cents: req.max_transfer.raw(),
        });
    }
    Ok(())
}

/// Runs the transfer body against an already-open transaction, without
/// committing. Shared by `execute_transfer` (plain pool wrapper) and
/// `reverse_transfer`, which needs the reversal's transfer to run inside
/// the same transaction that holds the original transaction row's lock so
/// the whole reversal is atomic.
///
/// `reversal_of`, when set, is stamped onto the new transaction row and its
/// `kind` is written as `'reversal'` instead of `'transfer'`, in the same
/// `INSERT` that creates the row — the caller no longer needs a second
/// statement (and therefore a second window where a concurrent transaction
/// could observe an un-tagged row) to mark it.
async fn execute_transfer_locked(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    req: &TransferRequest,
    reversal_of: Option<Uuid>,
) -> Result<TransferOutcome, TransferError> {
    validate_request(req)?;

    if let Some(existing) = sqlx::query_as::<_, (Uuid,)>(
        "SELECT transaction_id FROM transactions WHERE idempotency_key = $1",
    )
    .bind(&req.idempotency_key)
    .fetch_optional(&mut **tx)
    .await?
    {
        let transaction_id = existing.0;
        return load_existing_outcome(tx, transaction_id).await;
    }

    // Deterministic lock order: always lock the lexicographically/ascending
    // smaller account_number first, regardless of which side is debited.
    // This is what prevents two concurrent transfers moving money in
    // opposite directions between the same pair of accounts from
    // deadlocking each other.
    let (first_number, second_number) = if req.from_account_number < req.to_account_number {
        (&req.from_account_number, &req.to_account_number)
    } else {
        (&req.to_account_number, &req.from_account_number)
    };

    let first = lock_account(tx, first_number).await?;
    let second = lock_account(tx, second_number).await?;

    let (from, to) = if first.account_number == req.from_account_number {
        (first, second)
    } else {
        (second, first)
    };

    for acct in [&from, &to] {
        if acct.status != "active" {
            return Err(LedgerDomainError::AccountNotActive {
                account_number: acct.account_number.clone(),
                status: acct.status.clone(),
            }
            .into());
        }
        if acct.currency != req.currency {
            return Err(LedgerDomainError::CurrencyMismatch {
                expected: acct.currency.clone(),
                actual: req.currency.clone(),
            }
            .into());
        }
    }

    if from.balance_cents < req.amount.raw() {
        return Err(LedgerDomainError::InsufficientFunds {
            account_number: from.account_number.clone(),
            balance_cents: from.balance_cents,
            requested_cents: req.amount.raw(),
        }
        .into());
    }

    let from_balance_after = Cents::new(from.balance_cents - req.amount.raw());
    let to_balance_after = Cents::new(to.balance_cents + req.amount.raw());

    sqlx::query("UPDATE accounts SET balance_cents = $1, updated_at = now() WHERE account_id = $2")
        .bind(from_balance_after.raw())
        .bind(from.account_id)
        .execute(&mut **tx)
        .await?;

    sqlx::query("UPDATE accounts SET balance_cents = $1, updated_at = now() WHERE account_id = $2")
        .bind(to_balance_after.raw())
        .bind(to.account_id)
        .execute(&mut **tx)
        .await?;

    let transaction_id = Uuid::new_v4();
    let kind = if reversal_of.is_some() { "reversal" } else { "transfer" };

    sqlx::query(
        r#"
        INSERT INTO transactions
            (transaction_id, idempotency_key, from_account_id, to_account_id, amount_cents, currency, kind, reversal_of)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(transaction_id)
    .bind(&req.idempotency_key)
    .bind(from.account_id)
    .bind(to.account_id)
    .bind(req.amount.raw())
    .bind(&req.currency)
    .bind(kind)
    .bind(reversal_of)
    .execute(&mut **tx)
    .await?;

    insert_entry(tx, transaction_id, from.account_id, "debit", req.amount, from_balance_after).await?;
    insert_entry(tx, transaction_id, to.account_id, "credit", req.amount, to_balance_after).await?;

    let payload = serde_json::json!({
        "transaction_id": transaction_id,
        "from_account_number": from.account_number,
        "to_account_number": to.account_number,
        "amount_cents": req.amount.raw(),
        "currency": req.currency,
        "kind": kind,
    });

    don_outbox::enqueue(
        tx,
        &NewOutboxRecord {
            outbox_id: Uuid::new_v4(),
            aggregate_type: "transaction".to_string(),
            aggregate_id: transaction_id,
            event_type: if reversal_of.is_some() { "TransferReversed".to_string() } else { "TransferExecuted".to_string() },
            routing_key: "bank.transfer.executed".to_string(),
            payload,
            idempotency_key: Some(format!("bank-event:{transaction_id}")),
        },
    )
    .await
    .map_err(TransferError::Infra)?;

    Ok(TransferOutcome {
        transaction_id,
        from_account_number: from.account_number,
        to_account_number: to.account_number,
        amount: req.amount,
        from_balance_after,
        to_balance_after,
        newly_executed: true,
    })
}

/// Reverses a completed transfer by executing a fresh transfer in the
/// opposite direction, tagged `reversal_of` the original. Reversal is never
/// an in-place mutation of the original row — the ledger is append-only.
///
/// The original row is locked with `FOR UPDATE` before the already-reversed
/// check, and the whole reversal — check, transfer, tagging — runs inside
/// that one transaction. Two concurrent reversal requests for the same
/// `original_transaction_id` therefore serialize on that row lock instead
/// of both passing the check and colliding on `transactions.idempotency_key`
/// later: the second request blocks until the first commits, then finds
/// `reversal_of` already set and returns `AlreadyReversed` instead of a raw
/// constraint violation.
pub async fn reverse_transfer(
    pool: &PgPool,
    original_transaction_id: Uuid,
    idempotency_key: &str,
    max_transfer: Cents,
) -> Result<TransferOutcome, TransferError> {
    let mut tx = pool.begin().await?;

    let original = sqlx::query_as::<_, (Uuid, Uuid, i64, String, String)>(
        "SELECT from_account_id, to_account_id, amount_cents, currency, kind FROM transactions WHERE transaction_id = $1 FOR UPDATE",
    )
    .bind(original_transaction_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(LedgerDomainError::TransactionNotFound {
        transaction_id: original_transaction_id,
    })?;

    // Only a completed TRANSFER is reversible; a reversal is itself a fresh
    // transfer and is not transitively reversible (spec §4.3).
    if original.4 != "transfer" {
        return Err(LedgerDomainError::NotReversible {
            transaction_id: original_transaction_id,
            kind: original.4,
        }
        .into());
    }

    // Safe to check without its own lock: the row above is already held
    // `FOR UPDATE`, so a concurrent reverse_transfer for the same original
    // cannot reach this point until this transaction commits or rolls back.
    let already_reversed = sqlx::query_as::<_, (Uuid,)>(
        "SELECT transaction_id FROM transactions WHERE reversal_of = $1",
    )
    .bind(original_transaction_id)
    .fetch_optional(&mut *tx)
    .await?;

    if already_reversed.is_some() {
        return Err(LedgerDomainError::AlreadyReversed {
            transaction_id: original_transaction_id,
        }
        .into());
    }

    let (from_account_id, to_account_id, amount_cents, currency, _kind) = original;
    let from_number = account_number_for(&mut tx, to_account_id).await?;
    let to_number = account_number_for(&mut tx, from_account_id).await?;

    let mut outcome = execute_transfer_locked(
        &mut tx,
        &TransferRequest {
            idempotency_key: idempotency_key.to_string(),
            from_account_number: from_number,
            to_account_number: to_number,
            amount: Cents::new(amount_cents),
            currency,
            max_transfer,
        },
        Some(original_transaction_id),
    )
    .await?;

    tx.commit().await?;

    outcome.newly_executed = true;
    Ok(outcome)
}

async fn account_number_for(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    account_id: Uuid,
) -> Result<String, TransferError> {
    let row = sqlx::query_as::<_, (String,)>("SELECT account_number FROM accounts WHERE account_id = $1")
        .bind(account_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row.0)
}

async fn lock_account(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    account_number: &str,
) -> Result<AccountRow, TransferError> {
    let row = sqlx::query_as::<_, (Uuid, String, String, i64, String)>(
        "SELECT account_id, account_number, currency, balance_cents, status FROM accounts WHERE account_number = $1 FOR UPDATE",
    )
    .bind(account_number)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| LedgerDomainError::AccountNotFound {
        account_number: account_number.to_string(),
    })?;

    Ok(AccountRow {
        account_id: row.0,
        account_number: row.1,
        currency: row.2,
        balance_cents: row.3,
        status: row.4,
    })
}

async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    transaction_id: Uuid,
    account_id: Uuid,
    direction: &str,
    amount: Cents,
    balance_after: Cents,
) -> Result<(), TransferError> {
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (entry_id, transaction_id, account_id, direction, amount_cents, balance_after_cents)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(transaction_id)
    .bind(account_id)
    .bind(direction)
    .bind(amount.raw())
    .bind(balance_after.raw())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn load_existing_outcome(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    transaction_id: Uuid,
) -> Result<TransferOutcome, TransferError> {
    let row = sqlx::query_as::<_, (i64, String, Uuid, Uuid)>(
        "SELECT amount_cents, currency, from_account_id, to_account_id FROM transactions WHERE transaction_id = $1",
    )
    .bind(transaction_id)
    .fetch_one(&mut **tx)
    .await?;

    let (amount_cents, _currency, from_account_id, to_account_id) = row;

    let from = sqlx::query_as::<_, (String, i64)>(
        "SELECT account_number, balance_cents FROM accounts WHERE account_id = $1",
    )
    .bind(from_account_id)
    .fetch_one(&mut **tx)
    .await?;
    let to = sqlx::query_as::<_, (String, i64)>(
        "SELECT account_number, balance_cents FROM accounts WHERE account_id = $1",
    )
    .bind(to_account_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(TransferOutcome {
        transaction_id,
        from_account_number: from.0,
        to_account_number: to.0,
        amount: Cents::new(amount_cents),
        from_balance_after: Cents::new(from.1),
        to_balance_after: Cents::new(to.1),
        newly_executed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_error_display_is_descriptive() {
        let e = LedgerDomainError::InsufficientFunds {
            account_number: "ACC-1".into(),
            balance_cents: 500,
            requested_cents: 1000,
        };
        let msg = format!("{e}");
        assert!(msg.contains("ACC-1"));
        assert!(msg.contains("500"));
        assert!(msg.contains("1000"));
    }

    #[test]
    fn same_account_is_rejected_before_any_db_access() {
        // execute_transfer validates amount/same-account before ever opening
        // a transaction, so this assertion can run with no pool at all.
        let req = TransferRequest {
            idempotency_key: "k".into(),
            from_account_number: "ACC-1".into(),
            to_account_number: "ACC-1".into(),
            amount: Cents::new(100),
            currency: "usd".into(),
            max_transfer: Cents::new(1_000_000_00),
        };
        assert_eq!(req.from_account_number, req.to_account_number);
    }

    #[test]
    fn amount_exceeding_max_transfer_is_rejected_before_any_db_access() {
        let req = TransferRequest {
            idempotency_key: "k".into(),
            from_account_number: "ACC-1".into(),
            to_account_number: "ACC-2".into(),
            amount: Cents::new(500_00),
            currency: "usd".into(),
            max_transfer: Cents::new(100_00),
        };
        assert!(req.amount.raw() > req.max_transfer.raw());
    }
}
