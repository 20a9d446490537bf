//! Inbound webhook receipts and the idempotency ledger's vocabulary.
//!
//! One receipt exists per `(provider, event_key)` pair. Every redelivery of
//! the same pair touches that receipt instead of creating another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator as _};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr,
  Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReceiptStatus {
  Processing,
  Processed,
  Failed,
  /// The processor recognised the event as already applied under another
  /// key. Settled, like `Processed`.
  Duplicate,
}

impl ReceiptStatus {
  /// The receipt transition table.
  pub fn can_transition_to(self, next: Self) -> bool {
    use ReceiptStatus::*;
    match (self, next) {
      (Processing, Processed | Failed | Duplicate) => true,
      // A stale attempt is reclaimed; a failed one is retried.
      (Processing | Failed, Processing) => true,
      (Failed, Processed | Failed | Duplicate) => false,
      (Processed | Duplicate, _) => false,
    }
  }

  pub fn transition(self, next: Self) -> Result<Self> {
    if self.can_transition_to(next) {
      Ok(next)
    } else {
      Err(Error::InvalidTransition { from: self.to_string(), to: next.to_string() })
    }
  }

  pub fn sources_of(next: Self) -> Vec<Self> {
    Self::iter().filter(|s| s.can_transition_to(next)).collect()
  }

  /// Settled receipts are never forwarded to the processor again.
  pub fn is_settled(self) -> bool { matches!(self, Self::Processed | Self::Duplicate) }
}

/// A persisted webhook receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundWebhookReceipt {
  pub receipt_id:            Uuid,
  pub provider:              String,
  pub event_key:             String,
  pub event_type:            String,
  pub external_reference:    Option<String>,
  /// The most recently delivered body, kept for operator replay.
  pub payload:               Option<serde_json::Value>,
  pub status:                ReceiptStatus,
  pub attempt_count:         u32,
  pub first_received_at:     DateTime<Utc>,
  pub last_attempt_at:       DateTime<Utc>,
  /// When the current (or last) processing attempt began.
  pub processing_started_at: Option<DateTime<Utc>>,
  pub processed_at:          Option<DateTime<Utc>>,
  pub notes:                 Option<String>,
}

/// One delivery of a webhook, as seen by the ledger.
#[derive(Debug, Clone)]
pub struct Sighting {
  pub provider:           String,
  pub event_key:          String,
  pub event_type:         String,
  pub external_reference: Option<String>,
  pub payload:            Option<serde_json::Value>,
  pub at:                 DateTime<Utc>,
  /// A `Processing` receipt whose attempt began before this instant is
  /// considered abandoned and may be reclaimed.
  pub stale_before:       DateTime<Utc>,
}

/// Result of [`WebhookLedger::record_or_reject`](crate::store::WebhookLedger::record_or_reject).
#[derive(Debug, Clone)]
pub enum LedgerOutcome {
  /// First sighting; the receipt was created in `Processing`.
  FirstSeen(InboundWebhookReceipt),
  /// The pair was already known. `reclaimed` is true when this caller now
  /// owns a retry (the receipt was failed or stale and is `Processing`
  /// again).
  AlreadySeen { receipt: InboundWebhookReceipt, reclaimed: bool },
}

impl LedgerOutcome {
  pub fn receipt(&self) -> &InboundWebhookReceipt {
    match self {
      Self::FirstSeen(r) | Self::AlreadySeen { receipt: r, .. } => r,
    }
  }

  pub fn is_first_seen(&self) -> bool { matches!(self, Self::FirstSeen(_)) }
}

/// Result of [`WebhookLedger::reclaim_receipt`](crate::store::WebhookLedger::reclaim_receipt).
#[derive(Debug, Clone)]
pub enum ReclaimOutcome {
  Reclaimed(InboundWebhookReceipt),
  /// The receipt exists but is settled or another attempt is in flight.
  Unavailable(InboundWebhookReceipt),
  NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiptQuery {
  pub status:   Option<ReceiptStatus>,
  pub provider: Option<String>,
  pub limit:    Option<usize>,
  pub offset:   Option<usize>,
}
