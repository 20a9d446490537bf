//! The alert desk: raises finance alerts, notifies side channels, and
//! applies human acknowledgement transitions.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use relay_core::{
  alert::{AlertAction, AlertQuery, FinanceAlert, NewAlert, NotificationRecord, TransitionResult},
  collab::{Notification, NotificationTransport, TransportOutcome},
  store::AlertStore,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
  /// Realtime channel alerts are published on.
  pub realtime_channel:  String,
  /// Passed to the email transport as one comma-separated recipient spec.
  /// Empty leaves routing to the transport's own default list.
  pub email_recipients:  Vec<String>,
  pub notify_timeout_ms: u64,
}

impl Default for AlertConfig {
  fn default() -> Self {
    Self {
      realtime_channel:  "finance-alerts".to_owned(),
      email_recipients:  Vec::new(),
      notify_timeout_ms: 5_000,
    }
  }
}

pub struct AlertDesk<S, R, E> {
  store:    Arc<S>,
  realtime: Arc<R>,
  email:    Arc<E>,
  config:   Arc<AlertConfig>,
}

impl<S, R, E> Clone for AlertDesk<S, R, E> {
  fn clone(&self) -> Self {
    Self {
      store:    self.store.clone(),
      realtime: self.realtime.clone(),
      email:    self.email.clone(),
      config:   self.config.clone(),
    }
  }
}

impl<S, R, E> AlertDesk<S, R, E>
where
  S: AlertStore,
  R: NotificationTransport,
  E: NotificationTransport,
{
  pub fn new(store: Arc<S>, realtime: Arc<R>, email: Arc<E>, config: AlertConfig) -> Self {
    Self { store, realtime, email, config: Arc::new(config) }
  }

  /// Persist a new alert, then notify.
  ///
  /// The alert exists once this returns `Ok`, whatever the transports did;
  /// their outcomes are recorded on it.
  pub async fn raise(&self, input: NewAlert) -> Result<FinanceAlert> {
    let mut alert = self.store.insert_alert(input).await.map_err(Error::store)?;
    let alert_id = alert.alert_id;
    tracing::info!(%alert_id, severity = %alert.severity, alert_type = %alert.alert_type, "alert raised");

    let record = self.notify(&alert).await;
    if !self
      .store
      .record_notification(alert_id, record)
      .await
      .map_err(Error::store)?
    {
      tracing::warn!(%alert_id, "alert vanished before notifications were recorded");
    }
    alert.notifications = record;
    Ok(alert)
  }

  pub async fn acknowledge(&self, alert_id: Uuid, actor: &str) -> Result<FinanceAlert> {
    let actor = require_actor(actor)?;
    self.apply(alert_id, AlertAction::Acknowledge { actor }).await
  }

  pub async fn resolve(&self, alert_id: Uuid, actor: &str, note: Option<String>) -> Result<FinanceAlert> {
    let actor = require_actor(actor)?;
    self.apply(alert_id, AlertAction::Resolve { actor, note }).await
  }

  pub async fn mark_false_positive(
    &self,
    alert_id: Uuid,
    actor: &str,
    note: Option<String>,
  ) -> Result<FinanceAlert> {
    let actor = require_actor(actor)?;
    self.apply(alert_id, AlertAction::MarkFalsePositive { actor, note }).await
  }

  pub async fn get(&self, alert_id: Uuid) -> Result<FinanceAlert> {
    self
      .store
      .get_alert(alert_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::AlertNotFound(alert_id))
  }

  pub async fn list(&self, query: &AlertQuery) -> Result<Vec<FinanceAlert>> {
    self.store.list_alerts(query).await.map_err(Error::store)
  }

  async fn apply(&self, alert_id: Uuid, action: AlertAction) -> Result<FinanceAlert> {
    let requested = action.target_state();
    let actor = action.actor().to_owned();

    match self
      .store
      .transition_alert(alert_id, action, Utc::now())
      .await
      .map_err(Error::store)?
    {
      TransitionResult::Applied(alert) => {
        tracing::info!(%alert_id, state = %alert.state, %actor, "alert transitioned");
        Ok(alert)
      }
      TransitionResult::Rejected { current } => {
        tracing::debug!(%alert_id, %current, %requested, "alert transition rejected");
        Err(Error::InvalidTransition { id: alert_id, current, requested })
      }
      TransitionResult::NotFound => Err(Error::AlertNotFound(alert_id)),
    }
  }

  /// Realtime and email go out concurrently, each bounded by the notify
  /// timeout.
  async fn notify(&self, alert: &FinanceAlert) -> NotificationRecord {
    let notification = Notification {
      subject: format!("[{}] {}", alert.severity.as_ref().to_uppercase(), alert.alert_type),
      body:    alert.message.clone(),
      payload: Some(serde_json::json!({
        "alert_id": alert.alert_id,
        "alert_type": alert.alert_type,
        "trigger": alert.trigger,
        "severity": alert.severity,
        "raised_at": alert.raised_at,
        "payload": alert.payload,
      })),
    };
    let timeout = Duration::from_millis(self.config.notify_timeout_ms);
    let recipients = self.config.email_recipients.join(", ");

    let realtime = bounded(timeout, self.realtime.send(&self.config.realtime_channel, &notification));
    let email = bounded(timeout, self.email.send(&recipients, &notification));
    let (realtime, email) = tokio::join!(realtime, email);

    if let TransportOutcome::Failed(diagnostic) = &realtime {
      tracing::warn!(alert_id = %alert.alert_id, %diagnostic, "realtime alert publish failed");
    }
    if let TransportOutcome::Failed(diagnostic) = &email {
      tracing::warn!(alert_id = %alert.alert_id, %diagnostic, "alert email failed");
    }

    NotificationRecord {
      realtime_published: realtime.is_delivered(),
      email_attempted:    true,
      email_succeeded:    email.is_delivered(),
    }
  }
}

async fn bounded(
  timeout: Duration,
  send: impl std::future::Future<Output = TransportOutcome>,
) -> TransportOutcome {
  tokio::time::timeout(timeout, send)
    .await
    .unwrap_or_else(|_| TransportOutcome::Failed(format!("timed out after {timeout:?}")))
}

fn require_actor(actor: &str) -> Result<String> {
  match actor.trim() {
    "" => Err(Error::Validation("actor must not be empty".to_owned())),
    actor => Ok(actor.to_owned()),
  }
}
