//! notification-service library target.
//!
//! Exposes the bus consumers, notifier capability, and state for
//! integration tests; the binary `main.rs` is a thin wrapper around this
//! crate. Unlike the other services, this one has no HTTP surface of its
//! own — spec §4.5 describes it purely as a consumer loop.

pub mod consumer;
pub mod error;
pub mod models;
pub mod notifier;
