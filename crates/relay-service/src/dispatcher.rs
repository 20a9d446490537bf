//! The outbox dispatcher: a polling worker that claims due messages,
//! delivers them, and applies the outcome.
//!
//! A poll is two independent store round-trips around the network call:
//! the claim is committed first, then the channel is invoked without any
//! lock held, then the outcome is written as a conditional update on the
//! claim token. A worker that dies mid-batch leaves its messages
//! `Processing` with a claim that expires, after which any worker picks
//! them up again.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use rand_core::{OsRng, RngCore as _};
use relay_core::{
  collab::{ChannelSender, Delivery, SendOutcome},
  outbox::{ClaimRequest, OutboxMessage, OutboxStatus, OutboxTarget},
  retry::RetryPolicy,
  store::OutboxStore,
};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinSet, time::MissedTickBehavior};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
  /// Messages claimed per poll.
  pub batch_size:       usize,
  pub poll_interval_ms: u64,
  /// How long a claim stays exclusive before another worker may take it.
  pub claim_lease_ms:   u64,
  /// Upper bound on a single channel call; a timeout is retryable.
  pub send_timeout_ms:  u64,
  pub retry:            RetryPolicy,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    Self {
      batch_size:       50,
      poll_interval_ms: 1_000,
      claim_lease_ms:   60_000,
      send_timeout_ms:  10_000,
      retry:            RetryPolicy::default(),
    }
  }
}

impl DispatcherConfig {
  pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }

  pub fn send_timeout(&self) -> Duration { Duration::from_millis(self.send_timeout_ms) }
}

// ─── Reporting ────────────────────────────────────────────────────────────────

/// What one poll did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
  pub claimed:     usize,
  pub delivered:   usize,
  pub retried:     usize,
  pub failed:      usize,
  /// Outcomes discarded because the claim expired and was taken over.
  pub lost_claims: usize,
}

impl DispatchReport {
  fn absorb(&mut self, other: DispatchReport) {
    self.delivered += other.delivered;
    self.retried += other.retried;
    self.failed += other.failed;
    self.lost_claims += other.lost_claims;
  }

  fn count(&mut self, next: OutboxStatus, applied: bool) {
    match (applied, next) {
      (false, _) => self.lost_claims += 1,
      (true, OutboxStatus::Processed) => self.delivered += 1,
      (true, OutboxStatus::Pending) => self.retried += 1,
      (true, _) => self.failed += 1,
    }
  }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

/// Drains an [`OutboxStore`] through a [`ChannelSender`].
///
/// Several dispatchers may run against the same store; claims keep them from
/// attempting the same message concurrently.
pub struct Dispatcher<S, C> {
  store:     Arc<S>,
  channels:  Arc<C>,
  worker_id: Arc<str>,
  config:    Arc<DispatcherConfig>,
}

impl<S, C> Clone for Dispatcher<S, C> {
  fn clone(&self) -> Self {
    Self {
      store:     self.store.clone(),
      channels:  self.channels.clone(),
      worker_id: self.worker_id.clone(),
      config:    self.config.clone(),
    }
  }
}

impl<S, C> Dispatcher<S, C>
where
  S: OutboxStore + 'static,
  C: ChannelSender + 'static,
{
  pub fn new(store: Arc<S>, channels: Arc<C>, config: DispatcherConfig) -> Self {
    Self {
      store,
      channels,
      worker_id: format!("dispatcher-{}", Uuid::new_v4().simple()).into(),
      config: Arc::new(config),
    }
  }

  /// Set the worker ID recorded on claims.
  pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
    let id: String = id.into();
    self.worker_id = Arc::from(id);
    self
  }

  pub fn worker_id(&self) -> &str { &self.worker_id }

  /// Poll on a fixed interval until `shutdown` resolves.
  ///
  /// A batch that is already being delivered always runs to completion.
  /// Store errors are logged and the next tick tries again.
  pub async fn run(&self, shutdown: impl Future<Output = ()>) {
    let mut ticker = tokio::time::interval(self.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    tracing::info!(worker = %self.worker_id, "dispatcher started");
    loop {
      tokio::select! {
        biased;
        _ = &mut shutdown => break,
        _ = ticker.tick() => match self.run_once().await {
          Ok(report) if report.claimed > 0 => {
            tracing::info!(worker = %self.worker_id, ?report, "dispatched batch");
          }
          Ok(_) => {}
          Err(e) => tracing::error!(worker = %self.worker_id, error = %e, "dispatch poll failed"),
        },
      }
    }
    tracing::info!(worker = %self.worker_id, "dispatcher stopped");
  }

  /// Claim one batch and deliver it.
  ///
  /// Messages for the same target go out sequentially, oldest due first;
  /// different targets are delivered concurrently.
  pub async fn run_once(&self) -> Result<DispatchReport> {
    let now = Utc::now();
    let request = ClaimRequest {
      worker_id:   self.worker_id.to_string(),
      now,
      claim_until: after(now, Duration::from_millis(self.config.claim_lease_ms)),
      limit:       self.config.batch_size,
    };
    let claimed = self.store.claim_due(&request).await.map_err(Error::store)?;

    let mut report = DispatchReport { claimed: claimed.len(), ..Default::default() };
    if claimed.is_empty() {
      return Ok(report);
    }

    let mut lanes: HashMap<OutboxTarget, Vec<OutboxMessage>> = HashMap::new();
    for message in claimed {
      lanes.entry(message.target.clone()).or_default().push(message);
    }

    let mut set = JoinSet::new();
    for (_, lane) in lanes {
      let this = self.clone();
      set.spawn(async move { this.deliver_lane(lane).await });
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
      match joined {
        Ok(Ok(lane_report)) => report.absorb(lane_report),
        Ok(Err(e)) => {
          first_error.get_or_insert(e);
        }
        Err(e) => tracing::error!(error = %e, "delivery lane aborted"),
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(report),
    }
  }

  async fn deliver_lane(&self, lane: Vec<OutboxMessage>) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();
    for message in lane {
      let (next, applied) = self.attempt(message).await?;
      report.count(next, applied);
    }
    Ok(report)
  }

  /// Make one delivery attempt and record its outcome. Returns the status
  /// the message moved to and whether the update landed.
  async fn attempt(&self, message: OutboxMessage) -> Result<(OutboxStatus, bool)> {
    let id = message.message_id;
    let Some(token) = message.claim.as_ref().map(|c| c.token) else {
      tracing::warn!(message_id = %id, "claimed message carries no claim; skipping");
      return Ok((message.status, false));
    };

    // Only reachable by reclaiming an expired lease: the worker holding the
    // final attempt died before recording an outcome.
    let outcome = if message.attempt_count > self.config.retry.max_attempts {
      SendOutcome::PermanentFailure(format!(
        "claim lease expired after the final attempt ({} allowed)",
        self.config.retry.max_attempts
      ))
    } else if message.target.is_well_formed() {
      let delivery = Delivery::from(&message);
      let timeout = self.config.send_timeout();
      match tokio::time::timeout(timeout, self.channels.send(&delivery)).await {
        Ok(outcome) => outcome,
        Err(_) => SendOutcome::RetryableFailure(format!("send timed out after {timeout:?}")),
      }
    } else {
      SendOutcome::PermanentFailure(format!("malformed target {:?}", message.target))
    };

    let attempts = message.attempt_count;
    let retry = &self.config.retry;
    let next = match &outcome {
      SendOutcome::Success => OutboxStatus::Processed,
      SendOutcome::RetryableFailure(_) if retry.allows_retry(attempts) => OutboxStatus::Pending,
      SendOutcome::RetryableFailure(_) | SendOutcome::PermanentFailure(_) => OutboxStatus::Failed,
    };
    message.status.transition(next)?;

    let applied = match outcome {
      SendOutcome::Success => {
        tracing::info!(message_id = %id, attempt = attempts, "outbox message delivered");
        self.store.complete(id, token, Utc::now()).await
      }
      SendOutcome::RetryableFailure(reason) if next == OutboxStatus::Pending => {
        let delay = retry.delay(attempts, jitter_sample());
        let next_attempt_at = after(Utc::now(), delay);
        tracing::warn!(
          message_id = %id,
          attempt = attempts,
          %next_attempt_at,
          reason = %reason,
          "outbox delivery failed; will retry"
        );
        self.store.reschedule(id, token, next_attempt_at, reason).await
      }
      SendOutcome::RetryableFailure(reason) | SendOutcome::PermanentFailure(reason) => {
        tracing::error!(message_id = %id, attempt = attempts, reason = %reason, "outbox message failed");
        self.store.fail(id, token, reason).await
      }
    }
    .map_err(Error::store)?;

    if !applied {
      tracing::warn!(message_id = %id, "claim lost before the outcome was recorded");
    }
    Ok((next, applied))
  }
}

/// `at + delay`, saturating instead of overflowing.
fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
  TimeDelta::from_std(delay)
    .ok()
    .and_then(|d| at.checked_add_signed(d))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Uniform sample in `[0, 1)` for backoff jitter.
fn jitter_sample() -> f64 { (OsRng.next_u64() >> 11) as f64 / (1u64 << 53) as f64 }
