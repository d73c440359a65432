use chrono::{DateTime, Utc};
use don_money::Cents;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountRow {
    pub account_id: Uuid,
    pub owner_ref: Uuid,
    pub account_number: String,
    pub holder_name: String,
    pub contact: String,
    pub balance_cents: i64,
    pub currency: String,
    pub status: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub owner_ref: Uuid,
    pub account_number: String,
    pub holder_name: String,
    pub balance: String,
    pub currency: String,
    pub status: String,
    pub version: i32,
}

impl From<AccountRow> for AccountResponse {
    fn from(row: AccountRow) -> Self {
        AccountResponse {
            account_id: row.account_id,
            owner_ref: row.owner_ref,
            account_number: row.account_number,
            holder_name: row.holder_name,
            balance: Cents::new(row.balance_cents).to_string(),
            currency: row.currency,
            status: row.status,
            version: row.version,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenAccountRequest {
    pub owner_ref: Uuid,
    pub holder_name: String,
    pub contact: String,
    pub currency: String,
    #[serde(default)]
    pub opening_balance_cents: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequestBody {
    pub from_account_number: String,
    pub to_account_number: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub transaction_id: Uuid,
    pub from_account_number: String,
    pub to_account_number: String,
    pub amount: String,
    pub from_balance: String,
    pub to_balance: String,
}
