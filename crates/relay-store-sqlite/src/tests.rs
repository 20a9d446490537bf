//! Integration tests for `SqliteStore` against an in-memory database.

use chrono::{Duration, Utc};
use relay_core::{
  alert::{AlertAction, AlertQuery, AlertState, NewAlert, NotificationRecord, Severity, TransitionResult},
  outbox::{ClaimRequest, NewOutboxMessage, OutboxQuery, OutboxStatus, OutboxTarget, TargetKind},
  store::{AlertStore, OutboxStore, WebhookLedger},
  webhook::{LedgerOutcome, ReceiptQuery, ReceiptStatus, ReclaimOutcome, Sighting},
};
use uuid::Uuid;

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn claim(worker: &str, limit: usize) -> ClaimRequest {
  let now = Utc::now();
  ClaimRequest {
    worker_id:   worker.into(),
    now,
    claim_until: now + Duration::seconds(60),
    limit,
  }
}

fn role_message(role: &str) -> NewOutboxMessage {
  NewOutboxMessage::new(OutboxTarget::Role(role.into()), "invoice.overdue", "Invoice 42 is overdue")
}

// ─── Outbox ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn enqueue_and_get_message() {
  let s = store().await;

  let msg = s
    .enqueue(role_message("finance").with_payload(serde_json::json!({ "invoice": 42 })))
    .await
    .unwrap();
  assert_eq!(msg.status, OutboxStatus::Pending);
  assert_eq!(msg.attempt_count, 0);

  let fetched = s.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(fetched.target, OutboxTarget::Role("finance".into()));
  assert_eq!(fetched.payload, Some(serde_json::json!({ "invoice": 42 })));
  assert_eq!(fetched.next_attempt_at, msg.next_attempt_at);
  assert!(fetched.claim.is_none());
}

#[tokio::test]
async fn get_message_missing_returns_none() {
  let s = store().await;
  assert!(s.get_message(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_takes_due_messages_oldest_first() {
  let s = store().await;
  let now = Utc::now();

  let later = s
    .enqueue(role_message("a").not_before(now - Duration::seconds(5)))
    .await
    .unwrap();
  let earlier = s
    .enqueue(role_message("b").not_before(now - Duration::seconds(50)))
    .await
    .unwrap();
  let future = s
    .enqueue(role_message("c").not_before(now + Duration::hours(1)))
    .await
    .unwrap();

  let claimed = s.claim_due(&claim("w1", 10)).await.unwrap();
  let ids: Vec<_> = claimed.iter().map(|m| m.message_id).collect();
  assert_eq!(ids, vec![earlier.message_id, later.message_id]);
  assert!(claimed.iter().all(|m| m.status == OutboxStatus::Processing));
  assert!(claimed.iter().all(|m| m.attempt_count == 1));
  assert!(claimed.iter().all(|m| m.claim.as_ref().unwrap().worker_id == "w1"));

  let untouched = s.get_message(future.message_id).await.unwrap().unwrap();
  assert_eq!(untouched.status, OutboxStatus::Pending);
}

#[tokio::test]
async fn claim_respects_limit() {
  let s = store().await;
  for _ in 0..5 {
    s.enqueue(role_message("finance")).await.unwrap();
  }
  assert_eq!(s.claim_due(&claim("w1", 2)).await.unwrap().len(), 2);
  assert_eq!(s.claim_due(&claim("w2", 10)).await.unwrap().len(), 3);
  assert!(s.claim_due(&claim("w3", 10)).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_claims_never_overlap() {
  let s = store().await;
  let msg = s.enqueue(role_message("finance")).await.unwrap();

  let (c1, c2) = (claim("w1", 10), claim("w2", 10));
  let (a, b) = tokio::join!(s.claim_due(&c1), s.claim_due(&c2));
  let (a, b) = (a.unwrap(), b.unwrap());

  assert_eq!(a.len() + b.len(), 1);
  let winner = a.into_iter().chain(b).next().unwrap();
  assert_eq!(winner.message_id, msg.message_id);
}

#[tokio::test]
async fn expired_claim_is_reclaimable() {
  let s = store().await;
  let msg = s.enqueue(role_message("finance")).await.unwrap();

  let now = Utc::now();
  let abandoned = ClaimRequest {
    worker_id:   "crashed".into(),
    now,
    claim_until: now - Duration::milliseconds(1),
    limit:       1,
  };
  let first = s.claim_due(&abandoned).await.unwrap();
  assert_eq!(first.len(), 1);

  let second = s.claim_due(&claim("w2", 1)).await.unwrap();
  assert_eq!(second.len(), 1);
  assert_eq!(second[0].message_id, msg.message_id);
  assert_eq!(second[0].attempt_count, 2);

  // The crashed worker's late outcome must not land.
  let stale_token = first[0].claim.as_ref().unwrap().token;
  assert!(!s.complete(msg.message_id, stale_token, Utc::now()).await.unwrap());
  let current = s.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(current.status, OutboxStatus::Processing);
  assert_eq!(current.claim.unwrap().worker_id, "w2");
}

#[tokio::test]
async fn complete_sets_processed_at() {
  let s = store().await;
  let msg = s.enqueue(role_message("finance")).await.unwrap();
  let claimed = s.claim_due(&claim("w1", 1)).await.unwrap().remove(0);
  let token = claimed.claim.unwrap().token;

  assert!(s.complete(msg.message_id, token, Utc::now()).await.unwrap());
  let done = s.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(done.status, OutboxStatus::Processed);
  assert_eq!(done.attempt_count, 1);
  assert!(done.processed_at.unwrap() >= done.last_attempt_at.unwrap());
  assert!(done.claim.is_none());

  // Settled messages cannot be settled again.
  assert!(!s.fail(msg.message_id, token, "late".into()).await.unwrap());
}

#[tokio::test]
async fn reschedule_returns_message_to_pending() {
  let s = store().await;
  let msg = s.enqueue(role_message("finance")).await.unwrap();
  let token = s.claim_due(&claim("w1", 1)).await.unwrap()[0].claim.as_ref().unwrap().token;

  let next = Utc::now() + Duration::minutes(5);
  assert!(s.reschedule(msg.message_id, token, next, "timeout".into()).await.unwrap());

  let pending = s.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(pending.status, OutboxStatus::Pending);
  assert_eq!(pending.last_error.as_deref(), Some("timeout"));
  assert_eq!(pending.attempt_count, 1);
  assert!(pending.claim.is_none());

  // Not due yet.
  assert!(s.claim_due(&claim("w1", 1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn fail_keeps_message_visible() {
  let s = store().await;
  let msg = s.enqueue(NewOutboxMessage::new(OutboxTarget::BackOffice, "sync", "x")).await.unwrap();
  let token = s.claim_due(&claim("w1", 1)).await.unwrap()[0].claim.as_ref().unwrap().token;
  assert!(s.fail(msg.message_id, token, "rejected".into()).await.unwrap());

  let failed = s
    .list_messages(&OutboxQuery { status: Some(OutboxStatus::Failed), ..Default::default() })
    .await
    .unwrap();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].last_error.as_deref(), Some("rejected"));
  assert!(s.claim_due(&claim("w1", 1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_messages_filters_by_target() {
  let s = store().await;
  s.enqueue(role_message("finance")).await.unwrap();
  s.enqueue(NewOutboxMessage::new(OutboxTarget::User("u-1".into()), "welcome", "hi"))
    .await
    .unwrap();

  let users = s
    .list_messages(&OutboxQuery { target: Some(TargetKind::User), ..Default::default() })
    .await
    .unwrap();
  assert_eq!(users.len(), 1);
  assert_eq!(users[0].target, OutboxTarget::User("u-1".into()));
}

// ─── Webhook ledger ──────────────────────────────────────────────────────────

fn sighting(provider: &str, key: &str) -> Sighting {
  let now = Utc::now();
  Sighting {
    provider:           provider.into(),
    event_key:          key.into(),
    event_type:         "payment_intent.succeeded".into(),
    external_reference: Some("pi_1".into()),
    payload:            Some(serde_json::json!({ "amount": 1200 })),
    at:                 now,
    stale_before:       now - Duration::minutes(5),
  }
}

#[tokio::test]
async fn first_sighting_creates_processing_receipt() {
  let s = store().await;
  let outcome = s.record_or_reject(sighting("Stripe", "evt_123")).await.unwrap();

  let LedgerOutcome::FirstSeen(receipt) = outcome else {
    panic!("expected FirstSeen");
  };
  assert_eq!(receipt.status, ReceiptStatus::Processing);
  assert_eq!(receipt.attempt_count, 1);
  assert_eq!(receipt.first_received_at, receipt.last_attempt_at);
  assert_eq!(receipt.payload, Some(serde_json::json!({ "amount": 1200 })));
}

#[tokio::test]
async fn redelivery_touches_the_same_receipt() {
  let s = store().await;
  let first = s.record_or_reject(sighting("Stripe", "evt_123")).await.unwrap();
  let second = s.record_or_reject(sighting("Stripe", "evt_123")).await.unwrap();

  let LedgerOutcome::AlreadySeen { receipt, reclaimed } = second else {
    panic!("expected AlreadySeen");
  };
  // Still in flight and fresh: nobody else may take it.
  assert!(!reclaimed);
  assert_eq!(receipt.receipt_id, first.receipt().receipt_id);
  assert_eq!(receipt.attempt_count, 2);
  assert!(receipt.last_attempt_at >= receipt.first_received_at);

  let all = s.list_receipts(&ReceiptQuery::default()).await.unwrap();
  assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn same_key_different_provider_is_distinct() {
  let s = store().await;
  assert!(s.record_or_reject(sighting("Stripe", "evt_1")).await.unwrap().is_first_seen());
  assert!(s.record_or_reject(sighting("PayPal", "evt_1")).await.unwrap().is_first_seen());
}

#[tokio::test]
async fn concurrent_sightings_yield_one_first_seen() {
  let s = store().await;
  let mut set = tokio::task::JoinSet::new();
  for _ in 0..8 {
    let s = s.clone();
    set.spawn(async move { s.record_or_reject(sighting("Stripe", "evt_race")).await.unwrap() });
  }

  let mut first_seen = 0;
  while let Some(outcome) = set.join_next().await {
    if outcome.unwrap().is_first_seen() {
      first_seen += 1;
    }
  }
  assert_eq!(first_seen, 1);
  let receipt = s.find_receipt("Stripe", "evt_race").await.unwrap().unwrap();
  assert_eq!(receipt.attempt_count, 8);
}

#[tokio::test]
async fn failed_receipt_is_reclaimed_on_redelivery() {
  let s = store().await;
  let id = s.record_or_reject(sighting("Stripe", "evt_9")).await.unwrap().receipt().receipt_id;
  assert!(s.fail_receipt(id, "ledger down".into()).await.unwrap());

  let LedgerOutcome::AlreadySeen { receipt, reclaimed } =
    s.record_or_reject(sighting("Stripe", "evt_9")).await.unwrap()
  else {
    panic!("expected AlreadySeen");
  };
  assert!(reclaimed);
  assert_eq!(receipt.status, ReceiptStatus::Processing);
  assert_eq!(receipt.notes.as_deref(), Some("ledger down"));
}

#[tokio::test]
async fn stale_processing_receipt_is_reclaimed() {
  let s = store().await;
  s.record_or_reject(sighting("Stripe", "evt_stale")).await.unwrap();

  let mut later = sighting("Stripe", "evt_stale");
  later.stale_before = Utc::now() + Duration::seconds(1);
  let outcome = s.record_or_reject(later).await.unwrap();
  assert!(matches!(outcome, LedgerOutcome::AlreadySeen { reclaimed: true, .. }));
}

#[tokio::test]
async fn settled_receipt_is_never_reclaimed() {
  let s = store().await;
  let id = s.record_or_reject(sighting("Stripe", "evt_ok")).await.unwrap().receipt().receipt_id;
  assert!(s.settle_receipt(id, ReceiptStatus::Processed, None, Utc::now()).await.unwrap());

  let mut later = sighting("Stripe", "evt_ok");
  later.stale_before = Utc::now() + Duration::hours(1);
  let LedgerOutcome::AlreadySeen { receipt, reclaimed } = s.record_or_reject(later).await.unwrap() else {
    panic!("expected AlreadySeen");
  };
  assert!(!reclaimed);
  assert_eq!(receipt.status, ReceiptStatus::Processed);
  assert!(receipt.processed_at.is_some());

  let now = Utc::now();
  assert!(matches!(
    s.reclaim_receipt(id, now, now + Duration::hours(1)).await.unwrap(),
    ReclaimOutcome::Unavailable(_)
  ));
  assert!(!s.fail_receipt(id, "late".into()).await.unwrap());
}

#[tokio::test]
async fn settle_rejects_unsettled_status() {
  let s = store().await;
  let id = s.record_or_reject(sighting("Stripe", "evt_x")).await.unwrap().receipt().receipt_id;
  let err = s.settle_receipt(id, ReceiptStatus::Failed, None, Utc::now()).await.unwrap_err();
  assert!(matches!(err, crate::Error::Core(relay_core::Error::InvalidTransition { .. })));
}

#[tokio::test]
async fn reclaim_unknown_receipt_is_not_found() {
  let s = store().await;
  let now = Utc::now();
  assert!(matches!(
    s.reclaim_receipt(Uuid::new_v4(), now, now).await.unwrap(),
    ReclaimOutcome::NotFound
  ));
}

// ─── Alerts ──────────────────────────────────────────────────────────────────

fn alert(severity: Severity) -> NewAlert {
  NewAlert::new("refund_spike", "refunds > 3x daily mean", severity, "Refund volume spiked")
}

#[tokio::test]
async fn insert_alert_starts_new() {
  let s = store().await;
  let a = s.insert_alert(alert(Severity::High)).await.unwrap();
  assert_eq!(a.state, AlertState::New);
  assert_eq!(a.notifications, NotificationRecord::default());

  let fetched = s.get_alert(a.alert_id).await.unwrap().unwrap();
  assert_eq!(fetched.severity, Severity::High);
  assert_eq!(fetched.trigger, "refunds > 3x daily mean");
}

#[tokio::test]
async fn record_notification_sets_flags_independently() {
  let s = store().await;
  let a = s.insert_alert(alert(Severity::Low)).await.unwrap();
  let record = NotificationRecord {
    realtime_published: true,
    email_attempted:    true,
    email_succeeded:    false,
  };
  assert!(s.record_notification(a.alert_id, record).await.unwrap());
  assert_eq!(s.get_alert(a.alert_id).await.unwrap().unwrap().notifications, record);
  assert!(!s.record_notification(Uuid::new_v4(), record).await.unwrap());
}

#[tokio::test]
async fn acknowledge_then_resolve() {
  let s = store().await;
  let a = s.insert_alert(alert(Severity::Medium)).await.unwrap();

  let TransitionResult::Applied(acked) = s
    .transition_alert(a.alert_id, AlertAction::Acknowledge { actor: "dana".into() }, Utc::now())
    .await
    .unwrap()
  else {
    panic!("expected Applied");
  };
  assert_eq!(acked.state, AlertState::Acknowledged);
  assert_eq!(acked.acknowledged_by.as_deref(), Some("dana"));
  assert!(acked.resolved_at.is_none());

  let action = AlertAction::Resolve { actor: "lee".into(), note: Some("chargeback batch".into()) };
  let TransitionResult::Applied(resolved) =
    s.transition_alert(a.alert_id, action, Utc::now()).await.unwrap()
  else {
    panic!("expected Applied");
  };
  assert_eq!(resolved.state, AlertState::Resolved);
  assert_eq!(resolved.resolved_by.as_deref(), Some("lee"));
  assert_eq!(resolved.resolution_note.as_deref(), Some("chargeback batch"));
  assert_eq!(resolved.acknowledged_by.as_deref(), Some("dana"));
}

#[tokio::test]
async fn false_positive_after_acknowledge_clears_acknowledgement() {
  let s = store().await;
  let a = s.insert_alert(alert(Severity::High)).await.unwrap();
  s.transition_alert(a.alert_id, AlertAction::Acknowledge { actor: "dana".into() }, Utc::now())
    .await
    .unwrap();

  let action = AlertAction::MarkFalsePositive { actor: "lee".into(), note: Some("test card".into()) };
  let TransitionResult::Applied(fp) =
    s.transition_alert(a.alert_id, action, Utc::now()).await.unwrap()
  else {
    panic!("expected Applied");
  };
  assert_eq!(fp.state, AlertState::FalsePositive);
  assert!(fp.acknowledged_at.is_none());
  assert!(fp.acknowledged_by.is_none());
  assert_eq!(fp.resolved_by.as_deref(), Some("lee"));
  assert!(fp.resolved_at.is_some());

  let stored = s.get_alert(a.alert_id).await.unwrap().unwrap();
  assert!(stored.acknowledged_at.is_none());
}

#[tokio::test]
async fn terminal_alert_rejects_and_stays_unchanged() {
  let s = store().await;
  let a = s.insert_alert(alert(Severity::Critical)).await.unwrap();
  let action = AlertAction::MarkFalsePositive { actor: "dana".into(), note: None };
  s.transition_alert(a.alert_id, action, Utc::now()).await.unwrap();
  let before = s.get_alert(a.alert_id).await.unwrap().unwrap();

  for action in [
    AlertAction::Acknowledge { actor: "x".into() },
    AlertAction::Resolve { actor: "x".into(), note: Some("n".into()) },
    AlertAction::MarkFalsePositive { actor: "x".into(), note: None },
  ] {
    let result = s.transition_alert(a.alert_id, action, Utc::now()).await.unwrap();
    assert!(matches!(result, TransitionResult::Rejected { current: AlertState::FalsePositive }));
  }

  let after = s.get_alert(a.alert_id).await.unwrap().unwrap();
  assert_eq!(after.state_updated_at, before.state_updated_at);
  assert_eq!(after.resolved_by, before.resolved_by);
  assert!(after.acknowledged_at.is_none());
}

#[tokio::test]
async fn transition_missing_alert_is_not_found() {
  let s = store().await;
  let result = s
    .transition_alert(Uuid::new_v4(), AlertAction::Acknowledge { actor: "x".into() }, Utc::now())
    .await
    .unwrap();
  assert!(matches!(result, TransitionResult::NotFound));
}

#[tokio::test]
async fn list_alerts_orders_by_severity_and_filters() {
  let s = store().await;
  s.insert_alert(alert(Severity::Low)).await.unwrap();
  let critical = s.insert_alert(alert(Severity::Critical)).await.unwrap();
  s.insert_alert(alert(Severity::Medium)).await.unwrap();
  let high = s.insert_alert(alert(Severity::High)).await.unwrap();
  s.transition_alert(high.alert_id, AlertAction::Acknowledge { actor: "x".into() }, Utc::now())
    .await
    .unwrap();

  let all = s.list_alerts(&AlertQuery::default()).await.unwrap();
  let severities: Vec<_> = all.iter().map(|a| a.severity).collect();
  assert_eq!(severities, vec![Severity::Critical, Severity::High, Severity::Medium, Severity::Low]);

  let urgent_new = s
    .list_alerts(&AlertQuery {
      state: Some(AlertState::New),
      min_severity: Some(Severity::High),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(urgent_new.len(), 1);
  assert_eq!(urgent_new[0].alert_id, critical.alert_id);
}
