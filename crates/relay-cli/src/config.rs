//! Runtime configuration, layered from `relay.toml` and `RELAY_*`
//! environment variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use relay_service::{AlertConfig, DispatcherConfig, IntakeConfig};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
  pub store_path: PathBuf,
  /// Dispatcher workers started by `relay serve`.
  pub workers:    usize,
  pub dispatcher: DispatcherConfig,
  pub webhooks:   IntakeConfig,
  pub alerts:     AlertConfig,
}

impl Default for RelayConfig {
  fn default() -> Self {
    Self {
      store_path: PathBuf::from("relay.db"),
      workers:    1,
      dispatcher: DispatcherConfig::default(),
      webhooks:   IntakeConfig::default(),
      alerts:     AlertConfig::default(),
    }
  }
}

impl RelayConfig {
  /// Read `path` if it exists, then apply environment overrides such as
  /// `RELAY_WORKERS=4` or `RELAY_DISPATCHER__RETRY__MAX_ATTEMPTS=8`.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("RELAY")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true)
          .list_separator(",")
          .with_list_parse_key("webhooks.known_providers")
          .with_list_parse_key("alerts.email_recipients"),
      )
      .build()
      .with_context(|| format!("failed to read config from {}", path.display()))?;

    let mut cfg: Self = settings
      .try_deserialize()
      .context("failed to deserialise RelayConfig")?;
    cfg.store_path = expand_tilde(&cfg.store_path);
    Ok(cfg)
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
