use std::{sync::Arc, time::Duration};

use relay_core::{
  collab::{Channels, SendOutcome},
  outbox::{ClaimRequest, NewOutboxMessage, OutboxStatus, OutboxTarget},
  retry::RetryPolicy,
  store::OutboxStore,
};
use relay_store_sqlite::SqliteStore;

use super::{fakes::ScriptedSender, store};
use crate::{Dispatcher, DispatcherConfig};

fn config(max_attempts: u32) -> DispatcherConfig {
  DispatcherConfig {
    poll_interval_ms: 10,
    retry: RetryPolicy { max_attempts, base_delay_ms: 0, jitter: 0.0, ..Default::default() },
    ..Default::default()
  }
}

fn dispatcher(
  store: &Arc<SqliteStore>,
  sender: &Arc<ScriptedSender>,
  config: DispatcherConfig,
) -> Dispatcher<SqliteStore, ScriptedSender> {
  Dispatcher::new(store.clone(), sender.clone(), config)
}

fn overdue(target: OutboxTarget) -> NewOutboxMessage {
  NewOutboxMessage::new(target, "invoice.overdue", "Invoice 42 is overdue")
}

#[tokio::test]
async fn delivers_and_marks_processed() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::default());
  let msg = store
    .enqueue(overdue(OutboxTarget::BackOffice).with_payload(serde_json::json!({ "invoice": 42 })))
    .await
    .unwrap();

  let report = dispatcher(&store, &sender, config(5)).run_once().await.unwrap();
  assert_eq!(report.claimed, 1);
  assert_eq!(report.delivered, 1);

  let deliveries = sender.deliveries();
  assert_eq!(deliveries.len(), 1);
  assert_eq!(deliveries[0].message_id, msg.message_id);
  assert_eq!(deliveries[0].attempt, 1);
  assert_eq!(deliveries[0].payload, Some(serde_json::json!({ "invoice": 42 })));

  let stored = store.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(stored.status, OutboxStatus::Processed);
  assert_eq!(stored.attempt_count, 1);
  assert!(stored.processed_at.is_some());
  assert!(stored.claim.is_none());
}

#[tokio::test]
async fn empty_outbox_is_a_quiet_poll() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::default());

  let report = dispatcher(&store, &sender, config(5)).run_once().await.unwrap();
  assert_eq!(report, Default::default());
  assert_eq!(sender.calls(), 0);
}

#[tokio::test]
async fn retryable_failures_exhaust_into_failed() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::new([
    SendOutcome::RetryableFailure("503 from push gateway".into()),
    SendOutcome::RetryableFailure("503 from push gateway".into()),
    SendOutcome::RetryableFailure("connection reset".into()),
  ]));
  let msg = store.enqueue(overdue(OutboxTarget::Role("finance".into()))).await.unwrap();
  let d = dispatcher(&store, &sender, config(3));

  let first = d.run_once().await.unwrap();
  assert_eq!(first.retried, 1);
  let pending = store.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(pending.status, OutboxStatus::Pending);
  assert_eq!(pending.last_error.as_deref(), Some("503 from push gateway"));
  assert!(pending.next_attempt_at >= pending.last_attempt_at.unwrap());

  assert_eq!(d.run_once().await.unwrap().retried, 1);
  assert_eq!(d.run_once().await.unwrap().failed, 1);

  let failed = store.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(failed.status, OutboxStatus::Failed);
  assert_eq!(failed.attempt_count, 3);
  assert_eq!(failed.last_error.as_deref(), Some("connection reset"));
  assert_eq!(sender.calls(), 3);

  // Failed is terminal; nothing more is claimed.
  assert_eq!(d.run_once().await.unwrap().claimed, 0);
  assert_eq!(sender.calls(), 3);
}

#[tokio::test]
async fn expired_final_attempt_is_failed_without_resending() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::default());
  let msg = store.enqueue(overdue(OutboxTarget::Role("finance".into()))).await.unwrap();

  // Three workers each claim the message and die; their leases lapse at once.
  for worker in ["crashed-1", "crashed-2", "crashed-3"] {
    let now = chrono::Utc::now();
    let request = ClaimRequest { worker_id: worker.into(), now, claim_until: now, limit: 10 };
    assert_eq!(store.claim_due(&request).await.unwrap().len(), 1);
  }

  let report = dispatcher(&store, &sender, config(3)).run_once().await.unwrap();
  assert_eq!(report.claimed, 1);
  assert_eq!(report.failed, 1);
  assert_eq!(sender.calls(), 0);

  let stored = store.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(stored.status, OutboxStatus::Failed);
  assert!(stored.last_error.unwrap().contains("final attempt"));
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::new([SendOutcome::PermanentFailure(
    "user has no device".into(),
  )]));
  let msg = store.enqueue(overdue(OutboxTarget::User("u-17".into()))).await.unwrap();

  let report = dispatcher(&store, &sender, config(5)).run_once().await.unwrap();
  assert_eq!(report.failed, 1);

  let stored = store.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(stored.status, OutboxStatus::Failed);
  assert_eq!(stored.attempt_count, 1);
  assert_eq!(stored.last_error.as_deref(), Some("user has no device"));
}

#[tokio::test]
async fn malformed_target_fails_without_sending() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::default());
  let msg = store.enqueue(overdue(OutboxTarget::Role("  ".into()))).await.unwrap();

  let report = dispatcher(&store, &sender, config(5)).run_once().await.unwrap();
  assert_eq!(report.failed, 1);
  assert_eq!(sender.calls(), 0);

  let stored = store.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(stored.status, OutboxStatus::Failed);
  assert!(stored.last_error.unwrap().contains("malformed target"));
}

#[tokio::test]
async fn send_timeout_is_retryable() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::slow(Duration::from_millis(500)));
  let msg = store.enqueue(overdue(OutboxTarget::BackOffice)).await.unwrap();

  let config = DispatcherConfig { send_timeout_ms: 20, ..config(5) };
  let report = dispatcher(&store, &sender, config).run_once().await.unwrap();
  assert_eq!(report.retried, 1);

  let stored = store.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(stored.status, OutboxStatus::Pending);
  assert!(stored.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn two_workers_never_send_the_same_message() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::default());
  let msg = store.enqueue(overdue(OutboxTarget::Role("finance".into()))).await.unwrap();

  let a = dispatcher(&store, &sender, config(5)).with_worker_id("worker-a");
  let b = dispatcher(&store, &sender, config(5)).with_worker_id("worker-b");
  let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
  let (ra, rb) = (ra.unwrap(), rb.unwrap());

  assert_eq!(ra.claimed + rb.claimed, 1);
  assert_eq!(ra.delivered + rb.delivered, 1);
  assert_eq!(sender.calls(), 1);
  assert_eq!(sender.deliveries()[0].message_id, msg.message_id);
}

#[tokio::test]
async fn same_target_is_delivered_in_due_order() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::default());
  let now = chrono::Utc::now();
  let second = store
    .enqueue(overdue(OutboxTarget::User("u-1".into())).not_before(now - chrono::Duration::seconds(1)))
    .await
    .unwrap();
  let first = store
    .enqueue(overdue(OutboxTarget::User("u-1".into())).not_before(now - chrono::Duration::seconds(30)))
    .await
    .unwrap();

  let report = dispatcher(&store, &sender, config(5)).run_once().await.unwrap();
  assert_eq!(report.delivered, 2);

  let order: Vec<_> = sender.deliveries().iter().map(|d| d.message_id).collect();
  assert_eq!(order, vec![first.message_id, second.message_id]);
}

#[tokio::test]
async fn channels_route_by_target_kind() {
  let store = store().await;
  let back_office = Arc::new(ScriptedSender::default());
  let roles = Arc::new(ScriptedSender::default());
  let users = Arc::new(ScriptedSender::default());
  let channels = Arc::new(Channels {
    back_office: back_office.clone(),
    roles:       roles.clone(),
    users:       users.clone(),
  });

  store.enqueue(overdue(OutboxTarget::BackOffice)).await.unwrap();
  store.enqueue(overdue(OutboxTarget::Role("finance".into()))).await.unwrap();
  store.enqueue(overdue(OutboxTarget::Role("ops".into()))).await.unwrap();
  store.enqueue(overdue(OutboxTarget::User("u-9".into()))).await.unwrap();

  let report = Dispatcher::new(store.clone(), channels, config(5)).run_once().await.unwrap();
  assert_eq!(report.delivered, 4);
  assert_eq!(back_office.calls(), 1);
  assert_eq!(roles.calls(), 2);
  assert_eq!(users.calls(), 1);
  assert_eq!(users.deliveries()[0].target, OutboxTarget::User("u-9".into()));
}

#[tokio::test]
async fn run_loop_drains_until_shutdown() {
  let store = store().await;
  let sender = Arc::new(ScriptedSender::new([SendOutcome::RetryableFailure(
    "gateway busy".into(),
  )]));
  let msg = store.enqueue(overdue(OutboxTarget::BackOffice)).await.unwrap();

  let d = dispatcher(&store, &sender, config(5));
  tokio::time::timeout(
    Duration::from_secs(5),
    d.run(tokio::time::sleep(Duration::from_millis(300))),
  )
  .await
  .expect("run returns once shutdown resolves");

  let stored = store.get_message(msg.message_id).await.unwrap().unwrap();
  assert_eq!(stored.status, OutboxStatus::Processed);
  assert_eq!(stored.attempt_count, 2);
  assert_eq!(sender.calls(), 2);
}
