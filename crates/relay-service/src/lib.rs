//! Relay's three reliability services, generic over any store backend.
//!
//! - [`Dispatcher`] drains the outbox through a [`ChannelSender`], with
//!   claims, retries and backoff.
//! - [`WebhookIntake`] deduplicates provider callbacks against the ledger
//!   and forwards each logical event to a [`WebhookProcessor`].
//! - [`AlertDesk`] raises finance alerts, notifies side channels and applies
//!   human acknowledgement transitions.
//!
//! Collaborator failures never surface as `Err`; they are recorded on the
//! affected record. Only store failures propagate.
//!
//! [`ChannelSender`]: relay_core::collab::ChannelSender
//! [`WebhookProcessor`]: relay_core::collab::WebhookProcessor

pub mod alerts;
pub mod dispatcher;
pub mod error;
pub mod intake;

pub use alerts::{AlertConfig, AlertDesk};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherConfig};
pub use error::{Error, Result};
pub use intake::{InboundWebhook, IntakeConfig, IntakeOutcome, RejectReason, WebhookIntake};

#[cfg(test)]
mod tests;
