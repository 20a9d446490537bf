//! Log-only collaborators for running Relay without real transports.
//!
//! Every delivery, webhook and notification is written to the tracing
//! output and reported as successful.

use relay_core::collab::{
  ChannelSender, Channels, Delivery, Notification, NotificationTransport, ProcessOutcome,
  SendOutcome, TransportOutcome, WebhookEvent, WebhookProcessor,
};

pub type LogChannels = Channels<LogChannel, LogChannel, LogChannel>;

pub fn channels() -> LogChannels {
  Channels {
    back_office: LogChannel { sink: "back-office" },
    roles:       LogChannel { sink: "role-broadcast" },
    users:       LogChannel { sink: "user-notify" },
  }
}

pub struct LogChannel {
  sink: &'static str,
}

impl ChannelSender for LogChannel {
  async fn send(&self, delivery: &Delivery) -> SendOutcome {
    tracing::info!(
      sink = self.sink,
      message_id = %delivery.message_id,
      to = %delivery.target,
      event_type = %delivery.event_type,
      attempt = delivery.attempt,
      "{}",
      delivery.message
    );
    SendOutcome::Success
  }
}

pub struct LogProcessor;

impl WebhookProcessor for LogProcessor {
  async fn process(&self, event: &WebhookEvent) -> ProcessOutcome {
    tracing::info!(
      receipt_id = %event.receipt_id,
      provider = %event.provider,
      event_type = %event.event_type,
      external_reference = ?event.external_reference,
      "webhook event"
    );
    ProcessOutcome::Success
  }
}

pub struct LogTransport {
  pub name: &'static str,
}

impl NotificationTransport for LogTransport {
  async fn send(&self, recipient: &str, notification: &Notification) -> TransportOutcome {
    tracing::info!(transport = self.name, %recipient, subject = %notification.subject, "notification");
    TransportOutcome::Delivered
  }
}
