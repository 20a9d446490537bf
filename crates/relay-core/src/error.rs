//! Error types for `relay-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A state change that is not in the machine's transition table.
  #[error("invalid transition from {from} to {to}")]
  InvalidTransition { from: String, to: String },

  #[error("unknown {kind} discriminant: {value:?}")]
  UnknownDiscriminant { kind: &'static str, value: String },

  /// A role or user target persisted without its value.
  #[error("{0} target requires a value")]
  MissingTargetValue(&'static str),

  #[error("invalid target {0:?}; expected back-office, role:NAME or user:ID")]
  InvalidTarget(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
