//! Contracts for the external collaborators Relay drives.
//!
//! Relay never implements a transport itself. Channel senders, the webhook
//! processor and notification transports are supplied by the embedding
//! application and reached only through these traits. None of them report
//! errors through `Result`: every outcome is a value the caller records.

use std::{future::Future, sync::Arc};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  outbox::{OutboxMessage, OutboxTarget},
  webhook::InboundWebhookReceipt,
};

// ─── Outbox channels ─────────────────────────────────────────────────────────

/// One delivery attempt of an outbox message.
///
/// `message_id` is stable across attempts so receivers can discard
/// redeliveries; Relay guarantees at-least-once, not exactly-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
  pub message_id: Uuid,
  pub target:     OutboxTarget,
  pub event_type: String,
  pub message:    String,
  pub payload:    Option<serde_json::Value>,
  /// 1-based attempt number.
  pub attempt:    u32,
}

impl From<&OutboxMessage> for Delivery {
  fn from(m: &OutboxMessage) -> Self {
    Self {
      message_id: m.message_id,
      target:     m.target.clone(),
      event_type: m.event_type.clone(),
      message:    m.message.clone(),
      payload:    m.payload.clone(),
      attempt:    m.attempt_count,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum SendOutcome {
  Success,
  /// Transient; the message is retried with backoff.
  RetryableFailure(String),
  /// The channel rejected the message; it is failed without retry.
  PermanentFailure(String),
}

/// Transmits outbox messages to one kind of target.
pub trait ChannelSender: Send + Sync {
  fn send<'a>(
    &'a self,
    delivery: &'a Delivery,
  ) -> impl Future<Output = SendOutcome> + Send + 'a;
}

impl<T: ChannelSender> ChannelSender for Arc<T> {
  fn send<'a>(
    &'a self,
    delivery: &'a Delivery,
  ) -> impl Future<Output = SendOutcome> + Send + 'a {
    (**self).send(delivery)
  }
}

/// Routes each delivery to the sender for its target kind.
#[derive(Debug, Clone)]
pub struct Channels<B, R, U> {
  pub back_office: B,
  pub roles:       R,
  pub users:       U,
}

impl<B, R, U> ChannelSender for Channels<B, R, U>
where
  B: ChannelSender,
  R: ChannelSender,
  U: ChannelSender,
{
  async fn send(&self, delivery: &Delivery) -> SendOutcome {
    match delivery.target {
      OutboxTarget::BackOffice => self.back_office.send(delivery).await,
      OutboxTarget::Role(_) => self.roles.send(delivery).await,
      OutboxTarget::User(_) => self.users.send(delivery).await,
    }
  }
}

// ─── Webhook processing ──────────────────────────────────────────────────────

/// The business event carried by a webhook, handed to the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
  pub receipt_id:         Uuid,
  pub provider:           String,
  pub event_type:         String,
  pub external_reference: Option<String>,
  pub payload:            Option<serde_json::Value>,
}

impl From<&InboundWebhookReceipt> for WebhookEvent {
  fn from(r: &InboundWebhookReceipt) -> Self {
    Self {
      receipt_id:         r.receipt_id,
      provider:           r.provider.clone(),
      event_type:         r.event_type.clone(),
      external_reference: r.external_reference.clone(),
      payload:            r.payload.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ProcessOutcome {
  Success,
  Failure(String),
  /// The event was already applied under a different key.
  Duplicate(String),
}

/// Business logic reacting to a webhook.
///
/// Invoked at most once per settled event; it may be invoked again for an
/// event whose earlier attempt failed or was abandoned.
pub trait WebhookProcessor: Send + Sync {
  fn process<'a>(
    &'a self,
    event: &'a WebhookEvent,
  ) -> impl Future<Output = ProcessOutcome> + Send + 'a;
}

impl<T: WebhookProcessor> WebhookProcessor for Arc<T> {
  fn process<'a>(
    &'a self,
    event: &'a WebhookEvent,
  ) -> impl Future<Output = ProcessOutcome> + Send + 'a {
    (**self).process(event)
  }
}

// ─── Notification transports ────────────────────────────────────────────────

/// Content pushed over a realtime or email transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
  pub subject: String,
  pub body:    String,
  pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "diagnostic", rename_all = "snake_case")]
pub enum TransportOutcome {
  Delivered,
  Failed(String),
}

impl TransportOutcome {
  pub fn is_delivered(&self) -> bool { matches!(self, Self::Delivered) }
}

/// A realtime push or email transport.
pub trait NotificationTransport: Send + Sync {
  fn send<'a>(
    &'a self,
    recipient: &'a str,
    notification: &'a Notification,
  ) -> impl Future<Output = TransportOutcome> + Send + 'a;
}

impl<T: NotificationTransport> NotificationTransport for Arc<T> {
  fn send<'a>(
    &'a self,
    recipient: &'a str,
    notification: &'a Notification,
  ) -> impl Future<Output = TransportOutcome> + Send + 'a {
    (**self).send(recipient, notification)
  }
}
