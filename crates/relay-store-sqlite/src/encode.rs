//! Encoding and decoding helpers between Relay domain types and the
//! plain-text representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (UTC, microsecond
//! precision, `Z` suffix) so that SQL string comparison orders them
//! correctly. Enum columns use their `strum` snake_case names. Payloads are
//! compact JSON. UUIDs are hyphenated lowercase strings.

use chrono::{DateTime, SecondsFormat, Utc};
use relay_core::{
  alert::{AlertState, FinanceAlert, NotificationRecord, Severity},
  outbox::{Claim, OutboxMessage, OutboxStatus, OutboxTarget, TargetKind},
  webhook::{InboundWebhookReceipt, ReceiptStatus},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

pub fn encode_payload(p: Option<&serde_json::Value>) -> Result<Option<String>> {
  Ok(p.map(serde_json::to_string).transpose()?)
}

fn decode_payload(s: Option<String>) -> Result<Option<serde_json::Value>> {
  Ok(s.as_deref().map(serde_json::from_str).transpose()?)
}

fn decode_count(id: &str, n: i64) -> Result<u32> {
  u32::try_from(n).map_err(|_| Error::Corrupt {
    id:     id.to_owned(),
    reason: format!("attempt_count out of range: {n}"),
  })
}

/// Parse a `strum`-encoded enum column.
pub fn decode_enum<T: std::str::FromStr>(kind: &'static str, s: &str) -> Result<T> {
  s.parse().map_err(|_| {
    Error::Core(relay_core::Error::UnknownDiscriminant { kind, value: s.to_owned() })
  })
}

/// Render `states` as a quoted SQL `IN (...)` list body. The values are
/// static enum names, never user input.
pub fn sql_in_list<T: AsRef<str>>(states: &[T]) -> String {
  states
    .iter()
    .map(|s| format!("'{}'", s.as_ref()))
    .collect::<Vec<_>>()
    .join(", ")
}

// ─── Outbox rows ─────────────────────────────────────────────────────────────

pub const OUTBOX_COLUMNS: &str = "seq, message_id, target, target_value, event_type, message, \
   payload, status, attempt_count, last_error, next_attempt_at, last_attempt_at, \
   processed_at, created_at, claim_token, claimed_by, claim_expires_at";

/// Raw strings read directly from an `outbox_messages` row.
pub struct RawOutboxMessage {
  pub seq:              i64,
  pub message_id:       String,
  pub target:           String,
  pub target_value:     Option<String>,
  pub event_type:       String,
  pub message:          String,
  pub payload:          Option<String>,
  pub status:           String,
  pub attempt_count:    i64,
  pub last_error:       Option<String>,
  pub next_attempt_at:  String,
  pub last_attempt_at:  Option<String>,
  pub processed_at:     Option<String>,
  pub created_at:       String,
  pub claim_token:      Option<String>,
  pub claimed_by:       Option<String>,
  pub claim_expires_at: Option<String>,
}

impl RawOutboxMessage {
  /// Read a row selected with [`OUTBOX_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      seq:              row.get(0)?,
      message_id:       row.get(1)?,
      target:           row.get(2)?,
      target_value:     row.get(3)?,
      event_type:       row.get(4)?,
      message:          row.get(5)?,
      payload:          row.get(6)?,
      status:           row.get(7)?,
      attempt_count:    row.get(8)?,
      last_error:       row.get(9)?,
      next_attempt_at:  row.get(10)?,
      last_attempt_at:  row.get(11)?,
      processed_at:     row.get(12)?,
      created_at:       row.get(13)?,
      claim_token:      row.get(14)?,
      claimed_by:       row.get(15)?,
      claim_expires_at: row.get(16)?,
    })
  }

  pub fn into_message(self) -> Result<OutboxMessage> {
    let kind: TargetKind = decode_enum("target", &self.target)?;
    let target = OutboxTarget::from_parts(kind, self.target_value)?;

    let claim = match (self.claim_token, self.claimed_by, self.claim_expires_at) {
      (Some(token), Some(worker_id), Some(expires)) => Some(Claim {
        token: decode_uuid(&token)?,
        worker_id,
        expires_at: decode_dt(&expires)?,
      }),
      _ => None,
    };

    Ok(OutboxMessage {
      attempt_count: decode_count(&self.message_id, self.attempt_count)?,
      message_id: decode_uuid(&self.message_id)?,
      target,
      event_type: self.event_type,
      message: self.message,
      payload: decode_payload(self.payload)?,
      status: decode_enum::<OutboxStatus>("outbox status", &self.status)?,
      last_error: self.last_error,
      next_attempt_at: decode_dt(&self.next_attempt_at)?,
      last_attempt_at: decode_opt_dt(self.last_attempt_at)?,
      processed_at: decode_opt_dt(self.processed_at)?,
      created_at: decode_dt(&self.created_at)?,
      claim,
    })
  }
}

// ─── Webhook receipt rows ────────────────────────────────────────────────────

pub const RECEIPT_COLUMNS: &str = "receipt_id, provider, event_key, event_type, \
   external_reference, payload, status, attempt_count, first_received_at, \
   last_attempt_at, processing_started_at, processed_at, notes";

/// Raw strings read directly from a `webhook_receipts` row.
pub struct RawReceipt {
  pub receipt_id:            String,
  pub provider:              String,
  pub event_key:             String,
  pub event_type:            String,
  pub external_reference:    Option<String>,
  pub payload:               Option<String>,
  pub status:                String,
  pub attempt_count:         i64,
  pub first_received_at:     String,
  pub last_attempt_at:       String,
  pub processing_started_at: Option<String>,
  pub processed_at:          Option<String>,
  pub notes:                 Option<String>,
}

impl RawReceipt {
  /// Read a row selected with [`RECEIPT_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      receipt_id:            row.get(0)?,
      provider:              row.get(1)?,
      event_key:             row.get(2)?,
      event_type:            row.get(3)?,
      external_reference:    row.get(4)?,
      payload:               row.get(5)?,
      status:                row.get(6)?,
      attempt_count:         row.get(7)?,
      first_received_at:     row.get(8)?,
      last_attempt_at:       row.get(9)?,
      processing_started_at: row.get(10)?,
      processed_at:          row.get(11)?,
      notes:                 row.get(12)?,
    })
  }

  pub fn into_receipt(self) -> Result<InboundWebhookReceipt> {
    Ok(InboundWebhookReceipt {
      attempt_count: decode_count(&self.receipt_id, self.attempt_count)?,
      receipt_id: decode_uuid(&self.receipt_id)?,
      provider: self.provider,
      event_key: self.event_key,
      event_type: self.event_type,
      external_reference: self.external_reference,
      payload: decode_payload(self.payload)?,
      status: decode_enum::<ReceiptStatus>("receipt status", &self.status)?,
      first_received_at: decode_dt(&self.first_received_at)?,
      last_attempt_at: decode_dt(&self.last_attempt_at)?,
      processing_started_at: decode_opt_dt(self.processing_started_at)?,
      processed_at: decode_opt_dt(self.processed_at)?,
      notes: self.notes,
    })
  }
}

// ─── Alert rows ──────────────────────────────────────────────────────────────

pub const ALERT_COLUMNS: &str = "alert_id, alert_type, trigger_rule, severity, message, \
   payload, realtime_published, email_attempted, email_succeeded, state, raised_at, \
   state_updated_at, acknowledged_at, acknowledged_by, resolved_at, resolved_by, \
   resolution_note";

/// Raw values read directly from a `finance_alerts` row.
pub struct RawAlert {
  pub alert_id:           String,
  pub alert_type:         String,
  pub trigger_rule:       String,
  pub severity:           i64,
  pub message:            String,
  pub payload:            Option<String>,
  pub realtime_published: bool,
  pub email_attempted:    bool,
  pub email_succeeded:    bool,
  pub state:              String,
  pub raised_at:          String,
  pub state_updated_at:   String,
  pub acknowledged_at:    Option<String>,
  pub acknowledged_by:    Option<String>,
  pub resolved_at:        Option<String>,
  pub resolved_by:        Option<String>,
  pub resolution_note:    Option<String>,
}

impl RawAlert {
  /// Read a row selected with [`ALERT_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      alert_id:           row.get(0)?,
      alert_type:         row.get(1)?,
      trigger_rule:       row.get(2)?,
      severity:           row.get(3)?,
      message:            row.get(4)?,
      payload:            row.get(5)?,
      realtime_published: row.get(6)?,
      email_attempted:    row.get(7)?,
      email_succeeded:    row.get(8)?,
      state:              row.get(9)?,
      raised_at:          row.get(10)?,
      state_updated_at:   row.get(11)?,
      acknowledged_at:    row.get(12)?,
      acknowledged_by:    row.get(13)?,
      resolved_at:        row.get(14)?,
      resolved_by:        row.get(15)?,
      resolution_note:    row.get(16)?,
    })
  }

  pub fn into_alert(self) -> Result<FinanceAlert> {
    Ok(FinanceAlert {
      alert_id:         decode_uuid(&self.alert_id)?,
      alert_type:       self.alert_type,
      trigger:          self.trigger_rule,
      severity:         Severity::from_rank(self.severity)?,
      message:          self.message,
      payload:          decode_payload(self.payload)?,
      notifications:    NotificationRecord {
        realtime_published: self.realtime_published,
        email_attempted:    self.email_attempted,
        email_succeeded:    self.email_succeeded,
      },
      state:            decode_enum::<AlertState>("alert state", &self.state)?,
      raised_at:        decode_dt(&self.raised_at)?,
      state_updated_at: decode_dt(&self.state_updated_at)?,
      acknowledged_at:  decode_opt_dt(self.acknowledged_at)?,
      acknowledged_by:  self.acknowledged_by,
      resolved_at:      decode_opt_dt(self.resolved_at)?,
      resolved_by:      self.resolved_by,
      resolution_note:  self.resolution_note,
    })
  }
}
