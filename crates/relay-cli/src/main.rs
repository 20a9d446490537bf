//! `relay`: operate the outbox dispatcher, webhook ledger and alert desk.
//!
//! Reads `relay.toml` (or the path given with `--config`) layered with
//! `RELAY_*` environment variables, and opens the SQLite store named there.
//!
//! ```
//! relay serve --workers 4
//! relay outbox enqueue --target role:finance --event-type invoice.overdue --message "Invoice 42"
//! relay alerts ack 0b6f… --by dana
//! ```

mod config;
mod sinks;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use relay_core::{
  alert::{AlertQuery, AlertState, NewAlert, Severity},
  outbox::{NewOutboxMessage, OutboxQuery, OutboxStatus, OutboxTarget, TargetKind},
  store::OutboxStore,
  webhook::{ReceiptQuery, ReceiptStatus},
};
use relay_service::{AlertDesk, Dispatcher, InboundWebhook, WebhookIntake};
use relay_store_sqlite::SqliteStore;
use serde::Serialize;
use sinks::{LogChannels, LogProcessor, LogTransport};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::RelayConfig;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "relay", author, version, about = "Reliable outbound and inbound event plumbing")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "relay.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Run dispatcher workers until interrupted.
  Serve {
    /// Overrides `workers` from the config.
    #[arg(long)]
    workers: Option<usize>,
  },
  /// Run a single dispatcher poll and print its report.
  Dispatch,
  #[command(subcommand)]
  Outbox(OutboxCommand),
  #[command(subcommand)]
  Webhooks(WebhookCommand),
  #[command(subcommand)]
  Alerts(AlertCommand),
}

#[derive(Subcommand)]
enum OutboxCommand {
  Enqueue {
    /// `back-office`, `role:NAME` or `user:ID`.
    #[arg(long)]
    target:     OutboxTarget,
    #[arg(long)]
    event_type: String,
    #[arg(long)]
    message:    String,
    #[arg(long, value_parser = parse_json)]
    payload:    Option<serde_json::Value>,
  },
  List {
    #[arg(long)]
    status: Option<OutboxStatus>,
    #[arg(long)]
    target: Option<TargetKind>,
    #[arg(long)]
    limit:  Option<usize>,
  },
  Show { id: Uuid },
}

#[derive(Subcommand)]
enum WebhookCommand {
  /// Record and process one delivery, as a transport would.
  Receive {
    #[arg(long)]
    provider:   String,
    #[arg(long)]
    key:        String,
    #[arg(long)]
    event_type: String,
    #[arg(long)]
    reference:  Option<String>,
    #[arg(long, value_parser = parse_json)]
    payload:    Option<serde_json::Value>,
  },
  /// Retry a failed receipt from its stored payload.
  Replay { id: Uuid },
  List {
    #[arg(long)]
    status:   Option<ReceiptStatus>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    limit:    Option<usize>,
  },
  Show { id: Uuid },
}

#[derive(Subcommand)]
enum AlertCommand {
  Raise {
    #[arg(long = "type")]
    alert_type: String,
    #[arg(long)]
    trigger:    String,
    #[arg(long)]
    severity:   Severity,
    #[arg(long)]
    message:    String,
    #[arg(long, value_parser = parse_json)]
    payload:    Option<serde_json::Value>,
  },
  List {
    #[arg(long)]
    state:        Option<AlertState>,
    #[arg(long)]
    min_severity: Option<Severity>,
    #[arg(long)]
    limit:        Option<usize>,
  },
  Show { id: Uuid },
  Ack {
    id: Uuid,
    #[arg(long = "by")]
    actor: String,
  },
  Resolve {
    id:   Uuid,
    #[arg(long = "by")]
    actor: String,
    #[arg(long)]
    note:  Option<String>,
  },
  FalsePositive {
    id:   Uuid,
    #[arg(long = "by")]
    actor: String,
    #[arg(long)]
    note:  Option<String>,
  },
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let cfg = RelayConfig::load(&cli.config)?;

  let store = SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))?;
  let store = Arc::new(store);

  match cli.command {
    Command::Serve { workers } => serve(store, cfg, workers).await,
    Command::Dispatch => print_json(&dispatcher(store, &cfg).run_once().await?),
    Command::Outbox(cmd) => outbox(store, cmd).await,
    Command::Webhooks(cmd) => webhooks(store, cfg, cmd).await,
    Command::Alerts(cmd) => alerts(store, cfg, cmd).await,
  }
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn serve(store: Arc<SqliteStore>, cfg: RelayConfig, workers: Option<usize>) -> anyhow::Result<()> {
  let workers = workers.unwrap_or(cfg.workers).max(1);
  let (stop_tx, stop_rx) = watch::channel(false);

  let mut handles = Vec::with_capacity(workers);
  for n in 0..workers {
    let worker = dispatcher(store.clone(), &cfg).with_worker_id(format!("relay-{}-{n}", std::process::id()));
    let mut stop = stop_rx.clone();
    handles.push(tokio::spawn(async move {
      worker
        .run(async move {
          let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await;
    }));
  }
  tracing::info!(workers, store = ?cfg.store_path, "relay serving");

  tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
  tracing::info!("shutting down; finishing in-flight batches");
  stop_tx.send_replace(true);

  for handle in handles {
    handle.await.context("dispatcher worker panicked")?;
  }
  Ok(())
}

async fn outbox(store: Arc<SqliteStore>, cmd: OutboxCommand) -> anyhow::Result<()> {
  match cmd {
    OutboxCommand::Enqueue { target, event_type, message, payload } => {
      let mut input = NewOutboxMessage::new(target, event_type, message);
      input.payload = payload;
      print_json(&store.enqueue(input).await?)
    }
    OutboxCommand::List { status, target, limit } => {
      let query = OutboxQuery { status, target, limit, offset: None };
      print_json(&store.list_messages(&query).await?)
    }
    OutboxCommand::Show { id } => {
      let message = store
        .get_message(id)
        .await?
        .with_context(|| format!("no outbox message {id}"))?;
      print_json(&message)
    }
  }
}

async fn webhooks(store: Arc<SqliteStore>, cfg: RelayConfig, cmd: WebhookCommand) -> anyhow::Result<()> {
  let intake = WebhookIntake::new(store, Arc::new(LogProcessor), cfg.webhooks);
  match cmd {
    WebhookCommand::Receive { provider, key, event_type, reference, payload } => {
      let webhook = InboundWebhook {
        provider,
        event_key: key,
        event_type,
        external_reference: reference,
        payload,
      };
      print_json(&intake.receive(webhook).await?)
    }
    WebhookCommand::Replay { id } => print_json(&intake.replay(id).await?),
    WebhookCommand::List { status, provider, limit } => {
      let query = ReceiptQuery { status, provider, limit, offset: None };
      print_json(&intake.list(&query).await?)
    }
    WebhookCommand::Show { id } => print_json(&intake.get(id).await?),
  }
}

async fn alerts(store: Arc<SqliteStore>, cfg: RelayConfig, cmd: AlertCommand) -> anyhow::Result<()> {
  let desk = AlertDesk::new(
    store,
    Arc::new(LogTransport { name: "realtime" }),
    Arc::new(LogTransport { name: "email" }),
    cfg.alerts,
  );
  let alert = match cmd {
    AlertCommand::Raise { alert_type, trigger, severity, message, payload } => {
      let mut input = NewAlert::new(alert_type, trigger, severity, message);
      input.payload = payload;
      desk.raise(input).await?
    }
    AlertCommand::List { state, min_severity, limit } => {
      let query = AlertQuery { state, min_severity, limit, offset: None };
      return print_json(&desk.list(&query).await?);
    }
    AlertCommand::Show { id } => desk.get(id).await?,
    AlertCommand::Ack { id, actor } => desk.acknowledge(id, &actor).await?,
    AlertCommand::Resolve { id, actor, note } => desk.resolve(id, &actor, note).await?,
    AlertCommand::FalsePositive { id, actor, note } => {
      desk.mark_false_positive(id, &actor, note).await?
    }
  };
  print_json(&alert)
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn dispatcher(store: Arc<SqliteStore>, cfg: &RelayConfig) -> Dispatcher<SqliteStore, LogChannels> {
  Dispatcher::new(store, Arc::new(sinks::channels()), cfg.dispatcher.clone())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value).context("failed to render output")?);
  Ok(())
}

fn parse_json(raw: &str) -> Result<serde_json::Value, serde_json::Error> { serde_json::from_str(raw) }
