//! [`SqliteStore`]: the SQLite implementation of [`OutboxStore`],
//! [`WebhookLedger`] and [`AlertStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior, types::Value};
use uuid::Uuid;

use relay_core::{
  alert::{
    AlertAction, AlertQuery, AlertState, FinanceAlert, NewAlert, NotificationRecord,
    TransitionResult,
  },
  outbox::{ClaimRequest, NewOutboxMessage, OutboxMessage, OutboxQuery, OutboxStatus},
  store::{AlertStore, OutboxStore, WebhookLedger},
  webhook::{
    InboundWebhookReceipt, LedgerOutcome, ReceiptQuery, ReceiptStatus, ReclaimOutcome,
    Sighting,
  },
};

use crate::{
  Error, Result,
  encode::{
    ALERT_COLUMNS, OUTBOX_COLUMNS, RECEIPT_COLUMNS, RawAlert, RawOutboxMessage, RawReceipt,
    decode_enum, encode_dt, encode_payload, encode_uuid, sql_in_list,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Relay store backed by a single SQLite file.
///
/// Cloning is cheap: the inner connection is reference-counted. All clones
/// share one connection thread, and every state change is a single
/// statement or an `IMMEDIATE` transaction, so the conditional updates stay
/// atomic even when several processes open the same file.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run one statement; returns the number of rows it changed.
  async fn execute(&self, sql: String, params: Vec<Value>) -> Result<usize> {
    let changed = self
      .conn
      .call(move |conn| Ok(conn.execute(&sql, rusqlite::params_from_iter(params))?))
      .await?;
    Ok(changed)
  }

  /// Run one query and map every row with `map`.
  async fn query<R, F>(&self, sql: String, params: Vec<Value>, map: F) -> Result<Vec<R>>
  where
    R: Send + 'static,
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<R> + Send + 'static,
  {
    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), map)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }
}

fn page(limit: Option<usize>, offset: Option<usize>) -> (Value, Value) {
  let limit = limit.map_or(100, |l| l as i64);
  let offset = offset.unwrap_or(0) as i64;
  (Value::Integer(limit), Value::Integer(offset))
}

// ─── OutboxStore impl ────────────────────────────────────────────────────────

impl OutboxStore for SqliteStore {
  type Error = Error;

  async fn enqueue(&self, input: NewOutboxMessage) -> Result<OutboxMessage> {
    let now = Utc::now();
    let message = OutboxMessage {
      message_id:      Uuid::new_v4(),
      target:          input.target,
      event_type:      input.event_type,
      message:         input.message,
      payload:         input.payload,
      status:          OutboxStatus::Pending,
      attempt_count:   0,
      last_error:      None,
      next_attempt_at: input.not_before.unwrap_or(now),
      last_attempt_at: None,
      processed_at:    None,
      created_at:      now,
      claim:           None,
    };

    let params: Vec<Value> = vec![
      encode_uuid(message.message_id).into(),
      message.target.kind().as_ref().to_owned().into(),
      message.target.value().map(str::to_owned).into(),
      message.event_type.clone().into(),
      message.message.clone().into(),
      encode_payload(message.payload.as_ref())?.into(),
      message.status.as_ref().to_owned().into(),
      encode_dt(message.next_attempt_at).into(),
      encode_dt(message.created_at).into(),
    ];
    self
      .execute(
        "INSERT INTO outbox_messages (
           message_id, target, target_value, event_type, message, payload,
           status, attempt_count, next_attempt_at, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)"
          .to_owned(),
        params,
      )
      .await?;

    tracing::debug!(message_id = %message.message_id, to = %message.target, "enqueued outbox message");
    Ok(message)
  }

  async fn get_message(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
    let rows = self
      .query(
        format!("SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE message_id = ?1"),
        vec![encode_uuid(id).into()],
        RawOutboxMessage::from_row,
      )
      .await?;
    rows.into_iter().next().map(RawOutboxMessage::into_message).transpose()
  }

  async fn claim_due(&self, request: &ClaimRequest) -> Result<Vec<OutboxMessage>> {
    let pending = OutboxStatus::Pending.as_ref();
    let processing = OutboxStatus::Processing.as_ref();

    // One statement: the subquery picks due rows and the UPDATE flips them,
    // so no two claimants can win the same row.
    let sql = format!(
      "UPDATE outbox_messages
          SET status           = '{processing}',
              claim_token      = ?1,
              claimed_by       = ?2,
              claim_expires_at = ?3,
              attempt_count    = attempt_count + 1,
              last_attempt_at  = ?4
        WHERE seq IN (
          SELECT seq FROM outbox_messages
           WHERE (status = '{pending}'    AND next_attempt_at  <= ?4)
              OR (status = '{processing}' AND claim_expires_at <= ?4)
           ORDER BY next_attempt_at, seq
           LIMIT ?5)
        RETURNING {OUTBOX_COLUMNS}"
    );
    let params: Vec<Value> = vec![
      encode_uuid(Uuid::new_v4()).into(),
      request.worker_id.clone().into(),
      encode_dt(request.claim_until).into(),
      encode_dt(request.now).into(),
      Value::Integer(request.limit as i64),
    ];

    let mut raws = self.query(sql, params, RawOutboxMessage::from_row).await?;
    // RETURNING does not preserve the subquery's order.
    raws.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at).then(a.seq.cmp(&b.seq)));
    raws.into_iter().map(RawOutboxMessage::into_message).collect()
  }

  async fn complete(&self, id: Uuid, claim_token: Uuid, at: DateTime<Utc>) -> Result<bool> {
    let sources = sql_in_list(&OutboxStatus::sources_of(OutboxStatus::Processed));
    let sql = format!(
      "UPDATE outbox_messages
          SET status = '{}', processed_at = ?3,
              claim_token = NULL, claimed_by = NULL, claim_expires_at = NULL
        WHERE message_id = ?1 AND claim_token = ?2 AND status IN ({sources})",
      OutboxStatus::Processed.as_ref(),
    );
    let params: Vec<Value> = vec![
      encode_uuid(id).into(),
      encode_uuid(claim_token).into(),
      encode_dt(at).into(),
    ];
    Ok(self.execute(sql, params).await? == 1)
  }

  async fn reschedule(
    &self,
    id: Uuid,
    claim_token: Uuid,
    next_attempt_at: DateTime<Utc>,
    error: String,
  ) -> Result<bool> {
    let sources = sql_in_list(&OutboxStatus::sources_of(OutboxStatus::Pending));
    let sql = format!(
      "UPDATE outbox_messages
          SET status = '{}', next_attempt_at = ?3, last_error = ?4,
              claim_token = NULL, claimed_by = NULL, claim_expires_at = NULL
        WHERE message_id = ?1 AND claim_token = ?2 AND status IN ({sources})",
      OutboxStatus::Pending.as_ref(),
    );
    let params: Vec<Value> = vec![
      encode_uuid(id).into(),
      encode_uuid(claim_token).into(),
      encode_dt(next_attempt_at).into(),
      error.into(),
    ];
    Ok(self.execute(sql, params).await? == 1)
  }

  async fn fail(&self, id: Uuid, claim_token: Uuid, error: String) -> Result<bool> {
    let sources = sql_in_list(&OutboxStatus::sources_of(OutboxStatus::Failed));
    let sql = format!(
      "UPDATE outbox_messages
          SET status = '{}', last_error = ?3,
              claim_token = NULL, claimed_by = NULL, claim_expires_at = NULL
        WHERE message_id = ?1 AND claim_token = ?2 AND status IN ({sources})",
      OutboxStatus::Failed.as_ref(),
    );
    let params: Vec<Value> = vec![
      encode_uuid(id).into(),
      encode_uuid(claim_token).into(),
      error.into(),
    ];
    Ok(self.execute(sql, params).await? == 1)
  }

  async fn list_messages(&self, query: &OutboxQuery) -> Result<Vec<OutboxMessage>> {
    let (limit, offset) = page(query.limit, query.offset);
    let params: Vec<Value> = vec![
      query.status.map(|s| s.as_ref().to_owned()).into(),
      query.target.map(|t| t.as_ref().to_owned()).into(),
      limit,
      offset,
    ];
    let rows = self
      .query(
        format!(
          "SELECT {OUTBOX_COLUMNS} FROM outbox_messages
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR target = ?2)
            ORDER BY seq
            LIMIT ?3 OFFSET ?4"
        ),
        params,
        RawOutboxMessage::from_row,
      )
      .await?;
    rows.into_iter().map(RawOutboxMessage::into_message).collect()
  }
}

// ─── WebhookLedger impl ──────────────────────────────────────────────────────

/// Reclaim condition shared by redelivery and operator replay: failed, or
/// processing since before the stale cutoff (`?stale`).
fn reclaimable_clause(stale_param: &str) -> String {
  format!(
    "(status = '{failed}' OR (status = '{processing}' AND processing_started_at < {stale_param}))",
    failed = ReceiptStatus::Failed.as_ref(),
    processing = ReceiptStatus::Processing.as_ref(),
  )
}

impl WebhookLedger for SqliteStore {
  type Error = Error;

  async fn record_or_reject(&self, sighting: Sighting) -> Result<LedgerOutcome> {
    let receipt_id = encode_uuid(Uuid::new_v4());
    let at = encode_dt(sighting.at);
    let stale = encode_dt(sighting.stale_before);
    let payload = encode_payload(sighting.payload.as_ref())?;
    let processing = ReceiptStatus::Processing.as_ref();
    let reclaimable = reclaimable_clause("?4");
    let Sighting { provider, event_key, event_type, external_reference, .. } = sighting;

    let (raw, first_seen, reclaimed) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
          &format!(
            "INSERT INTO webhook_receipts (
               receipt_id, provider, event_key, event_type, external_reference,
               payload, status, attempt_count, first_received_at, last_attempt_at,
               processing_started_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{processing}', 1, ?7, ?7, ?7)
             ON CONFLICT (provider, event_key) DO NOTHING"
          ),
          rusqlite::params![
            receipt_id,
            provider,
            event_key,
            event_type,
            external_reference,
            payload,
            at,
          ],
        )?;

        let (first_seen, reclaimed) = if inserted == 1 {
          (true, false)
        } else {
          let reclaimed = tx.execute(
            &format!(
              "UPDATE webhook_receipts
                  SET status = '{processing}',
                      attempt_count = attempt_count + 1,
                      last_attempt_at = ?3,
                      processing_started_at = ?3,
                      payload = COALESCE(?5, payload)
                WHERE provider = ?1 AND event_key = ?2 AND {reclaimable}"
            ),
            rusqlite::params![provider, event_key, at, stale, payload],
          )? == 1;

          if !reclaimed {
            tx.execute(
              "UPDATE webhook_receipts
                  SET attempt_count = attempt_count + 1, last_attempt_at = ?3
                WHERE provider = ?1 AND event_key = ?2",
              rusqlite::params![provider, event_key, at],
            )?;
          }
          (false, reclaimed)
        };

        let raw = tx.query_row(
          &format!(
            "SELECT {RECEIPT_COLUMNS} FROM webhook_receipts WHERE provider = ?1 AND event_key = ?2"
          ),
          rusqlite::params![provider, event_key],
          RawReceipt::from_row,
        )?;
        tx.commit()?;
        Ok((raw, first_seen, reclaimed))
      })
      .await?;

    let receipt = raw.into_receipt()?;
    Ok(if first_seen {
      LedgerOutcome::FirstSeen(receipt)
    } else {
      LedgerOutcome::AlreadySeen { receipt, reclaimed }
    })
  }

  async fn reclaim_receipt(
    &self,
    id: Uuid,
    at: DateTime<Utc>,
    stale_before: DateTime<Utc>,
  ) -> Result<ReclaimOutcome> {
    let id_str = encode_uuid(id);
    let at = encode_dt(at);
    let stale = encode_dt(stale_before);
    let processing = ReceiptStatus::Processing.as_ref();
    let reclaimable = reclaimable_clause("?3");

    let (raw, reclaimed) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let reclaimed = tx.execute(
          &format!(
            "UPDATE webhook_receipts
                SET status = '{processing}',
                    attempt_count = attempt_count + 1,
                    last_attempt_at = ?2,
                    processing_started_at = ?2
              WHERE receipt_id = ?1 AND {reclaimable}"
          ),
          rusqlite::params![id_str, at, stale],
        )? == 1;
        let raw = tx
          .query_row(
            &format!("SELECT {RECEIPT_COLUMNS} FROM webhook_receipts WHERE receipt_id = ?1"),
            rusqlite::params![id_str],
            RawReceipt::from_row,
          )
          .optional()?;
        tx.commit()?;
        Ok((raw, reclaimed))
      })
      .await?;

    Ok(match raw {
      None => ReclaimOutcome::NotFound,
      Some(raw) if reclaimed => ReclaimOutcome::Reclaimed(raw.into_receipt()?),
      Some(raw) => ReclaimOutcome::Unavailable(raw.into_receipt()?),
    })
  }

  async fn settle_receipt(
    &self,
    id: Uuid,
    status: ReceiptStatus,
    note: Option<String>,
    at: DateTime<Utc>,
  ) -> Result<bool> {
    if !status.is_settled() {
      return Err(
        relay_core::Error::InvalidTransition {
          from: ReceiptStatus::Processing.to_string(),
          to:   status.to_string(),
        }
        .into(),
      );
    }
    let sources = sql_in_list(&ReceiptStatus::sources_of(status));
    let sql = format!(
      "UPDATE webhook_receipts
          SET status = ?2, processed_at = ?3, notes = COALESCE(?4, notes)
        WHERE receipt_id = ?1 AND status IN ({sources})"
    );
    let params: Vec<Value> = vec![
      encode_uuid(id).into(),
      status.as_ref().to_owned().into(),
      encode_dt(at).into(),
      note.into(),
    ];
    Ok(self.execute(sql, params).await? == 1)
  }

  async fn fail_receipt(&self, id: Uuid, note: String) -> Result<bool> {
    let sources = sql_in_list(&ReceiptStatus::sources_of(ReceiptStatus::Failed));
    let sql = format!(
      "UPDATE webhook_receipts SET status = '{}', notes = ?2
        WHERE receipt_id = ?1 AND status IN ({sources})",
      ReceiptStatus::Failed.as_ref(),
    );
    Ok(self.execute(sql, vec![encode_uuid(id).into(), note.into()]).await? == 1)
  }

  async fn get_receipt(&self, id: Uuid) -> Result<Option<InboundWebhookReceipt>> {
    let rows = self
      .query(
        format!("SELECT {RECEIPT_COLUMNS} FROM webhook_receipts WHERE receipt_id = ?1"),
        vec![encode_uuid(id).into()],
        RawReceipt::from_row,
      )
      .await?;
    rows.into_iter().next().map(RawReceipt::into_receipt).transpose()
  }

  async fn find_receipt(
    &self,
    provider: &str,
    event_key: &str,
  ) -> Result<Option<InboundWebhookReceipt>> {
    let rows = self
      .query(
        format!(
          "SELECT {RECEIPT_COLUMNS} FROM webhook_receipts WHERE provider = ?1 AND event_key = ?2"
        ),
        vec![provider.to_owned().into(), event_key.to_owned().into()],
        RawReceipt::from_row,
      )
      .await?;
    rows.into_iter().next().map(RawReceipt::into_receipt).transpose()
  }

  async fn list_receipts(&self, query: &ReceiptQuery) -> Result<Vec<InboundWebhookReceipt>> {
    let (limit, offset) = page(query.limit, query.offset);
    let params: Vec<Value> = vec![
      query.status.map(|s| s.as_ref().to_owned()).into(),
      query.provider.clone().into(),
      limit,
      offset,
    ];
    let rows = self
      .query(
        format!(
          "SELECT {RECEIPT_COLUMNS} FROM webhook_receipts
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR provider = ?2)
            ORDER BY last_attempt_at DESC, rowid DESC
            LIMIT ?3 OFFSET ?4"
        ),
        params,
        RawReceipt::from_row,
      )
      .await?;
    rows.into_iter().map(RawReceipt::into_receipt).collect()
  }
}

// ─── AlertStore impl ─────────────────────────────────────────────────────────

/// What a conditional alert update found, before decoding.
enum RawTransition {
  Applied(RawAlert),
  Rejected(String),
  NotFound,
}

impl AlertStore for SqliteStore {
  type Error = Error;

  async fn insert_alert(&self, input: NewAlert) -> Result<FinanceAlert> {
    let now = Utc::now();
    let alert = FinanceAlert {
      alert_id:         Uuid::new_v4(),
      alert_type:       input.alert_type,
      trigger:          input.trigger,
      severity:         input.severity,
      message:          input.message,
      payload:          input.payload,
      notifications:    NotificationRecord::default(),
      state:            AlertState::New,
      raised_at:        now,
      state_updated_at: now,
      acknowledged_at:  None,
      acknowledged_by:  None,
      resolved_at:      None,
      resolved_by:      None,
      resolution_note:  None,
    };

    let params: Vec<Value> = vec![
      encode_uuid(alert.alert_id).into(),
      alert.alert_type.clone().into(),
      alert.trigger.clone().into(),
      Value::Integer(alert.severity.rank()),
      alert.message.clone().into(),
      encode_payload(alert.payload.as_ref())?.into(),
      alert.state.as_ref().to_owned().into(),
      encode_dt(now).into(),
    ];
    self
      .execute(
        "INSERT INTO finance_alerts (
           alert_id, alert_type, trigger_rule, severity, message, payload,
           state, raised_at, state_updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)"
          .to_owned(),
        params,
      )
      .await?;
    Ok(alert)
  }

  async fn record_notification(&self, id: Uuid, record: NotificationRecord) -> Result<bool> {
    let params: Vec<Value> = vec![
      encode_uuid(id).into(),
      record.realtime_published.into(),
      record.email_attempted.into(),
      record.email_succeeded.into(),
    ];
    let changed = self
      .execute(
        "UPDATE finance_alerts
            SET realtime_published = ?2, email_attempted = ?3, email_succeeded = ?4
          WHERE alert_id = ?1"
          .to_owned(),
        params,
      )
      .await?;
    Ok(changed == 1)
  }

  async fn get_alert(&self, id: Uuid) -> Result<Option<FinanceAlert>> {
    let rows = self
      .query(
        format!("SELECT {ALERT_COLUMNS} FROM finance_alerts WHERE alert_id = ?1"),
        vec![encode_uuid(id).into()],
        RawAlert::from_row,
      )
      .await?;
    rows.into_iter().next().map(RawAlert::into_alert).transpose()
  }

  async fn transition_alert(
    &self,
    id: Uuid,
    action: AlertAction,
    at: DateTime<Utc>,
  ) -> Result<TransitionResult> {
    let target = action.target_state();
    let sources = sql_in_list(&AlertState::sources_of(target));

    let mut params: Vec<Value> = vec![
      encode_uuid(id).into(),
      target.as_ref().to_owned().into(),
      encode_dt(at).into(),
    ];
    let fields = match action {
      AlertAction::Acknowledge { actor } => {
        params.push(actor.into());
        "acknowledged_at = ?3, acknowledged_by = ?4"
      }
      AlertAction::Resolve { actor, note } => {
        params.push(actor.into());
        params.push(note.into());
        "resolved_at = ?3, resolved_by = ?4, resolution_note = ?5"
      }
      // A false positive was never a real acknowledged incident.
      AlertAction::MarkFalsePositive { actor, note } => {
        params.push(actor.into());
        params.push(note.into());
        "resolved_at = ?3, resolved_by = ?4, resolution_note = ?5,
         acknowledged_at = NULL, acknowledged_by = NULL"
      }
    };
    let sql = format!(
      "UPDATE finance_alerts SET state = ?2, state_updated_at = ?3, {fields}
        WHERE alert_id = ?1 AND state IN ({sources})"
    );
    let id_str = encode_uuid(id);

    let raw = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let applied = tx.execute(&sql, rusqlite::params_from_iter(params))? == 1;
        let outcome = if applied {
          RawTransition::Applied(tx.query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM finance_alerts WHERE alert_id = ?1"),
            rusqlite::params![id_str],
            RawAlert::from_row,
          )?)
        } else {
          let current: Option<String> = tx
            .query_row(
              "SELECT state FROM finance_alerts WHERE alert_id = ?1",
              rusqlite::params![id_str],
              |r| r.get(0),
            )
            .optional()?;
          current.map_or(RawTransition::NotFound, RawTransition::Rejected)
        };
        tx.commit()?;
        Ok(outcome)
      })
      .await?;

    Ok(match raw {
      RawTransition::Applied(raw) => TransitionResult::Applied(raw.into_alert()?),
      RawTransition::Rejected(state) => TransitionResult::Rejected {
        current: decode_enum("alert state", &state)?,
      },
      RawTransition::NotFound => TransitionResult::NotFound,
    })
  }

  async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<FinanceAlert>> {
    let (limit, offset) = page(query.limit, query.offset);
    let params: Vec<Value> = vec![
      query.state.map(|s| s.as_ref().to_owned()).into(),
      query.min_severity.map(|s| s.rank()).into(),
      limit,
      offset,
    ];
    let rows = self
      .query(
        format!(
          "SELECT {ALERT_COLUMNS} FROM finance_alerts
            WHERE (?1 IS NULL OR state = ?1)
              AND (?2 IS NULL OR severity >= ?2)
            ORDER BY severity DESC, raised_at DESC, rowid DESC
            LIMIT ?3 OFFSET ?4"
        ),
        params,
        RawAlert::from_row,
      )
      .await?;
    rows.into_iter().map(RawAlert::into_alert).collect()
  }
}
