//! Finance alerts and their acknowledgement lifecycle.
//!
//! ```text
//! New ──► Acknowledged ──► Resolved
//!  │           │      └──► FalsePositive
//!  ├──────────────────────► Resolved
//!  └──────────────────────► FalsePositive
//! ```
//!
//! `Resolved` and `FalsePositive` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator as _};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Severity ────────────────────────────────────────────────────────────────

/// Alert severity. Declaration order is the sort order.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
  Deserialize, AsRefStr, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

impl Severity {
  /// Stable integer rank, used as the stored sort key.
  pub fn rank(self) -> i64 {
    match self {
      Self::Low => 0,
      Self::Medium => 1,
      Self::High => 2,
      Self::Critical => 3,
    }
  }

  pub fn from_rank(rank: i64) -> Result<Self> {
    Self::iter().find(|s| s.rank() == rank).ok_or_else(|| {
      Error::UnknownDiscriminant { kind: "severity", value: rank.to_string() }
    })
  }
}

// ─── State machine ───────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr,
  Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertState {
  New,
  Acknowledged,
  Resolved,
  FalsePositive,
}

impl AlertState {
  /// The alert transition table.
  pub fn can_transition_to(self, next: Self) -> bool {
    use AlertState::*;
    match (self, next) {
      (New | Acknowledged, Acknowledged | Resolved | FalsePositive) => true,
      (New | Acknowledged, New) => false,
      (Resolved | FalsePositive, _) => false,
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

  pub fn is_terminal(self) -> bool { matches!(self, Self::Resolved | Self::FalsePositive) }
}

/// A human action on an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AlertAction {
  Acknowledge { actor: String },
  Resolve { actor: String, note: Option<String> },
  MarkFalsePositive { actor: String, note: Option<String> },
}

impl AlertAction {
  /// The state this action moves an alert into.
  pub fn target_state(&self) -> AlertState {
    match self {
      Self::Acknowledge { .. } => AlertState::Acknowledged,
      Self::Resolve { .. } => AlertState::Resolved,
      Self::MarkFalsePositive { .. } => AlertState::FalsePositive,
    }
  }

  pub fn actor(&self) -> &str {
    match self {
      Self::Acknowledge { actor }
      | Self::Resolve { actor, .. }
      | Self::MarkFalsePositive { actor, .. } => actor,
    }
  }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// Which side channels were tried when the alert was raised, and how they
/// went. Each flag is independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
  pub realtime_published: bool,
  pub email_attempted:    bool,
  pub email_succeeded:    bool,
}

/// A persisted finance alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinanceAlert {
  pub alert_id:         Uuid,
  pub alert_type:       String,
  /// The rule that fired.
  pub trigger:          String,
  pub severity:         Severity,
  pub message:          String,
  pub payload:          Option<serde_json::Value>,
  pub notifications:    NotificationRecord,
  pub state:            AlertState,
  pub raised_at:        DateTime<Utc>,
  pub state_updated_at: DateTime<Utc>,
  pub acknowledged_at:  Option<DateTime<Utc>>,
  pub acknowledged_by:  Option<String>,
  pub resolved_at:      Option<DateTime<Utc>>,
  pub resolved_by:      Option<String>,
  pub resolution_note:  Option<String>,
}

/// Input for [`AlertStore::insert_alert`](crate::store::AlertStore::insert_alert).
#[derive(Debug, Clone)]
pub struct NewAlert {
  pub alert_type: String,
  pub trigger:    String,
  pub severity:   Severity,
  pub message:    String,
  pub payload:    Option<serde_json::Value>,
}

impl NewAlert {
  pub fn new(
    alert_type: impl Into<String>,
    trigger: impl Into<String>,
    severity: Severity,
    message: impl Into<String>,
  ) -> Self {
    Self {
      alert_type: alert_type.into(),
      trigger: trigger.into(),
      severity,
      message: message.into(),
      payload: None,
    }
  }

  pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
    self.payload = Some(payload);
    self
  }
}

/// Result of [`AlertStore::transition_alert`](crate::store::AlertStore::transition_alert).
#[derive(Debug, Clone)]
pub enum TransitionResult {
  Applied(FinanceAlert),
  /// The table does not allow the move from `current`; nothing changed.
  Rejected { current: AlertState },
  NotFound,
}

/// Parameters for [`AlertStore::list_alerts`](crate::store::AlertStore::list_alerts).
/// Results are ordered by severity (highest first), then newest first.
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
  pub state:        Option<AlertState>,
  pub min_severity: Option<Severity>,
  pub limit:        Option<usize>,
  pub offset:       Option<usize>,
}
