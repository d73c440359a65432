pub mod error;
pub mod models;
pub mod outbox_poller;
pub mod routes;
pub mod state;
