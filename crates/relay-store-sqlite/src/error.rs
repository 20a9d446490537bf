//! Error type for `relay-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] relay_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored row that no longer decodes into a valid record.
  #[error("corrupt row {id}: {reason}")]
  Corrupt { id: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
