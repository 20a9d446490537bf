//! Core types and trait definitions for Relay.
//!
//! Relay is the delivery reliability layer of a line-of-business
//! application: an outbox that pushes facts to back-office, role and user
//! channels, an idempotency ledger for inbound provider webhooks, and the
//! lifecycle of raised finance alerts.
//!
//! This crate is deliberately free of database and runtime dependencies.
//! Storage backends implement the traits in [`store`]; the transports that
//! actually move bytes implement the traits in [`collab`].

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod alert;
pub mod collab;
pub mod error;
pub mod outbox;
pub mod retry;
pub mod store;
pub mod webhook;

pub use error::{Error, Result};
