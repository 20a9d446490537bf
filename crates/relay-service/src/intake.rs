//! Webhook intake: validate, record against the ledger, forward once.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use relay_core::{
  collab::{ProcessOutcome, WebhookEvent, WebhookProcessor},
  store::WebhookLedger,
  webhook::{InboundWebhookReceipt, LedgerOutcome, ReceiptQuery, ReceiptStatus, ReclaimOutcome, Sighting},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{Error, Result};

const MAX_PROVIDER_LEN: usize = 64;
const MAX_EVENT_KEY_LEN: usize = 255;

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
  /// Accepted providers. Empty accepts any well-formed provider name.
  pub known_providers:    Vec<String>,
  /// A `Processing` receipt older than this is treated as abandoned and
  /// may be retried by the next delivery.
  pub stale_after_ms:     u64,
  /// Upper bound on one processor call; a timeout counts as a failure.
  pub process_timeout_ms: u64,
}

impl Default for IntakeConfig {
  fn default() -> Self {
    Self {
      known_providers:    Vec::new(),
      stale_after_ms:     5 * 60 * 1_000,
      process_timeout_ms: 30_000,
    }
  }
}

// ─── Inputs and outcomes ──────────────────────────────────────────────────────

/// A provider callback as handed over by the transport layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundWebhook {
  pub provider:           String,
  pub event_key:          String,
  pub event_type:         String,
  pub external_reference: Option<String>,
  pub payload:            Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
  #[error("provider is missing")]
  MissingProvider,
  #[error("event key is missing")]
  MissingEventKey,
  #[error("provider name is malformed")]
  MalformedProvider,
  #[error("event key is malformed")]
  MalformedEventKey,
  #[error("unknown provider {0:?}")]
  UnknownProvider(String),
}

/// What happened to one delivery. Mapping this to a transport status code
/// is the caller's job; `Failed` should be answered so that the provider
/// redelivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IntakeOutcome {
  /// Forwarded and processed.
  Accepted { receipt_id: Uuid },
  /// Already settled, or still in flight under another delivery. An
  /// in-flight receipt is not settled yet: if that attempt fails, the
  /// provider's next redelivery (or an operator replay) retries it.
  Duplicate { receipt_id: Uuid },
  Rejected { reason: RejectReason },
  /// Recorded, but processing failed; the receipt is retryable.
  Failed { receipt_id: Uuid, reason: String },
}

// ─── Intake ───────────────────────────────────────────────────────────────────

pub struct WebhookIntake<S, P> {
  ledger:    Arc<S>,
  processor: Arc<P>,
  config:    Arc<IntakeConfig>,
}

impl<S, P> Clone for WebhookIntake<S, P> {
  fn clone(&self) -> Self {
    Self {
      ledger:    self.ledger.clone(),
      processor: self.processor.clone(),
      config:    self.config.clone(),
    }
  }
}

impl<S, P> WebhookIntake<S, P>
where
  S: WebhookLedger,
  P: WebhookProcessor,
{
  pub fn new(ledger: Arc<S>, processor: Arc<P>, config: IntakeConfig) -> Self {
    Self { ledger, processor, config: Arc::new(config) }
  }

  /// Handle one delivery of a provider callback.
  pub async fn receive(&self, webhook: InboundWebhook) -> Result<IntakeOutcome> {
    let (provider, event_key) = match self.validate(&webhook) {
      Ok(ids) => ids,
      Err(reason) => {
        tracing::debug!(provider = %webhook.provider, %reason, "rejected webhook");
        return Ok(IntakeOutcome::Rejected { reason });
      }
    };

    let now = Utc::now();
    let sighting = Sighting {
      provider,
      event_key,
      event_type: webhook.event_type,
      external_reference: webhook.external_reference,
      payload: webhook.payload,
      at: now,
      stale_before: self.stale_cutoff(now),
    };

    match self.ledger.record_or_reject(sighting).await.map_err(Error::store)? {
      LedgerOutcome::FirstSeen(receipt) => self.forward(receipt).await,
      LedgerOutcome::AlreadySeen { receipt, reclaimed: true } => {
        tracing::info!(
          receipt_id = %receipt.receipt_id,
          attempt = receipt.attempt_count,
          "retrying webhook on redelivery"
        );
        self.forward(receipt).await
      }
      LedgerOutcome::AlreadySeen { receipt, .. } => {
        tracing::debug!(receipt_id = %receipt.receipt_id, status = %receipt.status, "duplicate webhook");
        Ok(IntakeOutcome::Duplicate { receipt_id: receipt.receipt_id })
      }
    }
  }

  /// Operator-triggered retry of a failed or abandoned receipt, using the
  /// payload stored with it.
  pub async fn replay(&self, receipt_id: Uuid) -> Result<IntakeOutcome> {
    let now = Utc::now();
    let outcome = self
      .ledger
      .reclaim_receipt(receipt_id, now, self.stale_cutoff(now))
      .await
      .map_err(Error::store)?;

    match outcome {
      ReclaimOutcome::Reclaimed(receipt) => {
        tracing::info!(%receipt_id, "replaying webhook");
        self.forward(receipt).await
      }
      ReclaimOutcome::Unavailable(receipt) => {
        tracing::debug!(%receipt_id, status = %receipt.status, "receipt not replayable");
        Ok(IntakeOutcome::Duplicate { receipt_id })
      }
      ReclaimOutcome::NotFound => Err(Error::ReceiptNotFound(receipt_id)),
    }
  }

  pub async fn get(&self, receipt_id: Uuid) -> Result<InboundWebhookReceipt> {
    self
      .ledger
      .get_receipt(receipt_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::ReceiptNotFound(receipt_id))
  }

  pub async fn find(&self, provider: &str, event_key: &str) -> Result<Option<InboundWebhookReceipt>> {
    self.ledger.find_receipt(provider, event_key).await.map_err(Error::store)
  }

  pub async fn list(&self, query: &ReceiptQuery) -> Result<Vec<InboundWebhookReceipt>> {
    self.ledger.list_receipts(query).await.map_err(Error::store)
  }

  /// Hand a receipt this caller owns to the processor and settle it.
  async fn forward(&self, receipt: InboundWebhookReceipt) -> Result<IntakeOutcome> {
    let receipt_id = receipt.receipt_id;
    let event = WebhookEvent::from(&receipt);
    let timeout = Duration::from_millis(self.config.process_timeout_ms);

    let outcome = match tokio::time::timeout(timeout, self.processor.process(&event)).await {
      Ok(outcome) => outcome,
      Err(_) => ProcessOutcome::Failure(format!("processing timed out after {timeout:?}")),
    };

    match outcome {
      ProcessOutcome::Success => {
        self.settle(receipt_id, ReceiptStatus::Processed, None).await?;
        tracing::info!(%receipt_id, event_type = %event.event_type, "webhook processed");
        Ok(IntakeOutcome::Accepted { receipt_id })
      }
      ProcessOutcome::Duplicate(reason) => {
        self.settle(receipt_id, ReceiptStatus::Duplicate, Some(reason)).await?;
        tracing::info!(%receipt_id, "webhook already applied under another key");
        Ok(IntakeOutcome::Duplicate { receipt_id })
      }
      ProcessOutcome::Failure(reason) => {
        let recorded = self
          .ledger
          .fail_receipt(receipt_id, reason.clone())
          .await
          .map_err(Error::store)?;
        if !recorded {
          tracing::warn!(%receipt_id, "receipt settled elsewhere while processing failed");
        }
        tracing::warn!(%receipt_id, %reason, "webhook processing failed");
        Ok(IntakeOutcome::Failed { receipt_id, reason })
      }
    }
  }

  async fn settle(&self, receipt_id: Uuid, status: ReceiptStatus, note: Option<String>) -> Result<()> {
    let settled = self
      .ledger
      .settle_receipt(receipt_id, status, note, Utc::now())
      .await
      .map_err(Error::store)?;
    if !settled {
      tracing::warn!(%receipt_id, %status, "receipt was no longer processing when settled");
    }
    Ok(())
  }

  fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    let window = TimeDelta::milliseconds(self.config.stale_after_ms.min(i64::MAX as u64) as i64);
    now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
  }

  /// Returns the `(provider, event_key)` pair to record, with the provider
  /// in its configured spelling.
  fn validate(&self, webhook: &InboundWebhook) -> Result<(String, String), RejectReason> {
    let provider = webhook.provider.trim();
    let event_key = webhook.event_key.trim();

    if provider.is_empty() {
      return Err(RejectReason::MissingProvider);
    }
    if event_key.is_empty() {
      return Err(RejectReason::MissingEventKey);
    }
    if provider.len() > MAX_PROVIDER_LEN
      || !provider.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
      return Err(RejectReason::MalformedProvider);
    }
    if event_key.len() > MAX_EVENT_KEY_LEN || event_key.chars().any(char::is_control) {
      return Err(RejectReason::MalformedEventKey);
    }

    let provider = if self.config.known_providers.is_empty() {
      provider.to_owned()
    } else {
      self
        .config
        .known_providers
        .iter()
        .find(|known| known.eq_ignore_ascii_case(provider))
        .cloned()
        .ok_or_else(|| RejectReason::UnknownProvider(provider.to_owned()))?
    };

    Ok((provider, event_key.to_owned()))
  }
}
