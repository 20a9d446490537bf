//! Outbox messages: durable facts waiting to reach a delivery channel.
//!
//! A message is created `Pending` by any producer and from then on is only
//! mutated by a dispatcher. Messages are never deleted; a message that
//! exhausts its attempts stays visible as `Failed` with its last error.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator as _};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Target ──────────────────────────────────────────────────────────────────

/// The column-level discriminant of an [`OutboxTarget`].
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr,
  Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TargetKind {
  BackOffice,
  Role,
  User,
}

/// Who a message is addressed to.
///
/// Role and user targets always carry their value; a back-office message
/// goes to the single back-office sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutboxTarget {
  BackOffice,
  /// A role group, e.g. `"finance"`.
  Role(String),
  /// A specific user identifier.
  User(String),
}

impl OutboxTarget {
  pub fn kind(&self) -> TargetKind {
    match self {
      Self::BackOffice => TargetKind::BackOffice,
      Self::Role(_) => TargetKind::Role,
      Self::User(_) => TargetKind::User,
    }
  }

  pub fn value(&self) -> Option<&str> {
    match self {
      Self::BackOffice => None,
      Self::Role(v) | Self::User(v) => Some(v),
    }
  }

  /// Rebuild a target from its stored `(kind, value)` columns.
  pub fn from_parts(kind: TargetKind, value: Option<String>) -> Result<Self> {
    match (kind, value) {
      (TargetKind::BackOffice, _) => Ok(Self::BackOffice),
      (TargetKind::Role, Some(v)) => Ok(Self::Role(v)),
      (TargetKind::User, Some(v)) => Ok(Self::User(v)),
      (TargetKind::Role, None) => Err(Error::MissingTargetValue("role")),
      (TargetKind::User, None) => Err(Error::MissingTargetValue("user")),
    }
  }

  /// A role or user target whose value is blank cannot be delivered.
  pub fn is_well_formed(&self) -> bool {
    self.value().is_none_or(|v| !v.trim().is_empty())
  }
}

impl fmt::Display for OutboxTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::BackOffice => f.write_str("back-office"),
      Self::Role(r) => write!(f, "role:{r}"),
      Self::User(u) => write!(f, "user:{u}"),
    }
  }
}

impl FromStr for OutboxTarget {
  type Err = Error;

  /// Parses `back-office`, `role:NAME` or `user:ID`.
  fn from_str(s: &str) -> Result<Self> {
    if s == "back-office" || s == "back_office" {
      return Ok(Self::BackOffice);
    }
    match s.split_once(':') {
      Some(("role", v)) if !v.trim().is_empty() => Ok(Self::Role(v.to_owned())),
      Some(("user", v)) if !v.trim().is_empty() => Ok(Self::User(v.to_owned())),
      _ => Err(Error::InvalidTarget(s.to_owned())),
    }
  }
}

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr,
  Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutboxStatus {
  Pending,
  Processing,
  Processed,
  Failed,
}

impl OutboxStatus {
  /// The outbox transition table.
  pub fn can_transition_to(self, next: Self) -> bool {
    use OutboxStatus::*;
    match (self, next) {
      (Pending, Processing) => true,
      // An expired claim is taken over by another worker.
      (Processing, Processing) => true,
      (Processing, Processed | Pending | Failed) => true,
      (Pending, Pending | Processed | Failed) => false,
      (Processed | Failed, _) => false,
    }
  }

  /// Check `self -> next` against the table.
  pub fn transition(self, next: Self) -> Result<Self> {
    if self.can_transition_to(next) {
      Ok(next)
    } else {
      Err(Error::InvalidTransition { from: self.to_string(), to: next.to_string() })
    }
  }

  /// Every status that may move to `next`.
  pub fn sources_of(next: Self) -> Vec<Self> {
    Self::iter().filter(|s| s.can_transition_to(next)).collect()
  }

  pub fn is_terminal(self) -> bool { matches!(self, Self::Processed | Self::Failed) }
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// The exclusive right of one worker to attempt a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
  pub token:      Uuid,
  pub worker_id:  String,
  pub expires_at: DateTime<Utc>,
}

/// A persisted outbox message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
  pub message_id:      Uuid,
  pub target:          OutboxTarget,
  pub event_type:      String,
  pub message:         String,
  pub payload:         Option<serde_json::Value>,
  pub status:          OutboxStatus,
  pub attempt_count:   u32,
  pub last_error:      Option<String>,
  pub next_attempt_at: DateTime<Utc>,
  pub last_attempt_at: Option<DateTime<Utc>>,
  pub processed_at:    Option<DateTime<Utc>>,
  pub created_at:      DateTime<Utc>,
  /// Present only while the message is `Processing`.
  pub claim:           Option<Claim>,
}

/// Input for [`OutboxStore::enqueue`](crate::store::OutboxStore::enqueue).
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
  pub target:     OutboxTarget,
  pub event_type: String,
  pub message:    String,
  pub payload:    Option<serde_json::Value>,
  /// Earliest delivery time; `None` means immediately.
  pub not_before: Option<DateTime<Utc>>,
}

impl NewOutboxMessage {
  pub fn new(
    target: OutboxTarget,
    event_type: impl Into<String>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      target,
      event_type: event_type.into(),
      message: message.into(),
      payload: None,
      not_before: None,
    }
  }

  pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
    self.payload = Some(payload);
    self
  }

  pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
    self.not_before = Some(at);
    self
  }
}

/// Parameters for [`OutboxStore::claim_due`](crate::store::OutboxStore::claim_due).
#[derive(Debug, Clone)]
pub struct ClaimRequest {
  pub worker_id:   String,
  /// Messages due at or before this instant are eligible.
  pub now:         DateTime<Utc>,
  /// The claim expires here; an expired claim may be taken by any worker.
  pub claim_until: DateTime<Utc>,
  pub limit:       usize,
}

/// Parameters for [`OutboxStore::list_messages`](crate::store::OutboxStore::list_messages).
#[derive(Debug, Clone, Default)]
pub struct OutboxQuery {
  pub status: Option<OutboxStatus>,
  pub target: Option<TargetKind>,
  pub limit:  Option<usize>,
  pub offset: Option<usize>,
}
