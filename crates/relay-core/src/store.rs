//! Store traits for the three durable record sets.
//!
//! The traits are implemented by storage backends (e.g. `relay-store-sqlite`).
//! Services in `relay-service` depend on this abstraction, not on any
//! concrete backend.
//!
//! Every state change is a single conditional update against the store of
//! record. Losing a race is not an error: it is reported through the return
//! value (`false`, [`LedgerOutcome::AlreadySeen`],
//! [`TransitionResult::Rejected`]) so callers branch on it. `Err` is reserved
//! for the store itself failing.
//!
//! All methods return `Send` futures so the traits can be used in
//! multi-threaded async runtimes.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  alert::{AlertAction, AlertQuery, FinanceAlert, NewAlert, NotificationRecord, TransitionResult},
  outbox::{ClaimRequest, NewOutboxMessage, OutboxMessage, OutboxQuery},
  webhook::{
    InboundWebhookReceipt, LedgerOutcome, ReceiptQuery, ReceiptStatus, ReclaimOutcome,
    Sighting,
  },
};

// ─── Outbox ──────────────────────────────────────────────────────────────────

/// Durable queue of outbound messages.
pub trait OutboxStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Persist a new `Pending` message.
  fn enqueue(
    &self,
    input: NewOutboxMessage,
  ) -> impl Future<Output = Result<OutboxMessage, Self::Error>> + Send + '_;

  fn get_message(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<OutboxMessage>, Self::Error>> + Send + '_;

  /// Atomically claim up to `limit` due messages, oldest `next_attempt_at`
  /// first. Claiming moves a message to `Processing`, stamps a fresh claim
  /// token and increments `attempt_count`. Messages whose earlier claim has
  /// expired are claimable again. Concurrent callers never receive the same
  /// message for the same attempt.
  fn claim_due<'a>(
    &'a self,
    request: &'a ClaimRequest,
  ) -> impl Future<Output = Result<Vec<OutboxMessage>, Self::Error>> + Send + 'a;

  /// `Processing -> Processed`. Returns `false` if the claim was lost.
  fn complete(
    &self,
    id: Uuid,
    claim_token: Uuid,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// `Processing -> Pending` with a new due time. Returns `false` if the
  /// claim was lost.
  fn reschedule(
    &self,
    id: Uuid,
    claim_token: Uuid,
    next_attempt_at: DateTime<Utc>,
    error: String,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// `Processing -> Failed`. Returns `false` if the claim was lost.
  fn fail(
    &self,
    id: Uuid,
    claim_token: Uuid,
    error: String,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn list_messages<'a>(
    &'a self,
    query: &'a OutboxQuery,
  ) -> impl Future<Output = Result<Vec<OutboxMessage>, Self::Error>> + Send + 'a;
}

// ─── Webhook ledger ──────────────────────────────────────────────────────────

/// Idempotency ledger of inbound webhook receipts.
pub trait WebhookLedger: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Record a sighting of `(provider, event_key)`, atomically.
  ///
  /// The first sighting creates a `Processing` receipt. Later sightings bump
  /// `attempt_count` and `last_attempt_at` on the same receipt and, when it
  /// is `Failed` or stale `Processing`, reclaim it for this caller.
  fn record_or_reject(
    &self,
    sighting: Sighting,
  ) -> impl Future<Output = Result<LedgerOutcome, Self::Error>> + Send + '_;

  /// Operator replay: reclaim a failed or stale receipt by id.
  fn reclaim_receipt(
    &self,
    id: Uuid,
    at: DateTime<Utc>,
    stale_before: DateTime<Utc>,
  ) -> impl Future<Output = Result<ReclaimOutcome, Self::Error>> + Send + '_;

  /// Settle a `Processing` receipt as `Processed` or `Duplicate`. Returns
  /// `false` if it was no longer `Processing`.
  fn settle_receipt(
    &self,
    id: Uuid,
    status: ReceiptStatus,
    note: Option<String>,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// `Processing -> Failed`. Returns `false` if it was no longer
  /// `Processing`.
  fn fail_receipt(
    &self,
    id: Uuid,
    note: String,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn get_receipt(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<InboundWebhookReceipt>, Self::Error>> + Send + '_;

  fn find_receipt<'a>(
    &'a self,
    provider: &'a str,
    event_key: &'a str,
  ) -> impl Future<Output = Result<Option<InboundWebhookReceipt>, Self::Error>> + Send + 'a;

  fn list_receipts<'a>(
    &'a self,
    query: &'a ReceiptQuery,
  ) -> impl Future<Output = Result<Vec<InboundWebhookReceipt>, Self::Error>> + Send + 'a;
}

// ─── Alerts ──────────────────────────────────────────────────────────────────

/// Log of raised finance alerts.
pub trait AlertStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Persist a new alert in state `New` with no notifications recorded.
  fn insert_alert(
    &self,
    input: NewAlert,
  ) -> impl Future<Output = Result<FinanceAlert, Self::Error>> + Send + '_;

  /// Record the side-channel outcome of raising an alert.
  fn record_notification(
    &self,
    id: Uuid,
    record: NotificationRecord,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn get_alert(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<FinanceAlert>, Self::Error>> + Send + '_;

  /// Apply `action` if the alert's current state allows it, as one
  /// conditional update. A rejected action leaves every field unchanged.
  fn transition_alert(
    &self,
    id: Uuid,
    action: AlertAction,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<TransitionResult, Self::Error>> + Send + '_;

  fn list_alerts<'a>(
    &'a self,
    query: &'a AlertQuery,
  ) -> impl Future<Output = Result<Vec<FinanceAlert>, Self::Error>> + Send + 'a;
}
