//! totals-service library target.
//!
//! Exposes the router, state, and cache-invalidation consumer for
//! integration tests; the binary `main.rs` is a thin wrapper around this
//! crate.

pub mod consumer;
pub mod error;
pub mod models;
pub mod routes;
pub mod state;
