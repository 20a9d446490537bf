//! Error type for `relay-service`.

use relay_core::alert::AlertState;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("alert not found: {0}")]
  AlertNotFound(Uuid),

  #[error("webhook receipt not found: {0}")]
  ReceiptNotFound(Uuid),

  /// A human action on an alert whose state does not allow it. The alert
  /// is unchanged.
  #[error("alert {id} is {current}; cannot move it to {requested}")]
  InvalidTransition {
    id:        Uuid,
    current:   AlertState,
    requested: AlertState,
  },

  #[error("invalid input: {0}")]
  Validation(String),

  #[error("core error: {0}")]
  Core(#[from] relay_core::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  pub(crate) fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
