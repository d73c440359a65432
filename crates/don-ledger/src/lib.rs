//! Double-entry ledger engine.
//!
//! `bank-service` is the only caller of this crate; it is split out because
//! the transfer algorithm — deterministic lock ordering, conservation of
//! value, idempotent retries — is exactly the kind of self-contained,
//! heavily-tested domain logic the rest of this workspace keeps in its own
//! crate (mirrors how the teacher keeps portfolio accounting out of the
//! daemon binary).

mod transfer;

pub use transfer::{
    execute_transfer, reverse_transfer, LedgerDomainError, TransferError, TransferOutcome,
    TransferRequest,
};
