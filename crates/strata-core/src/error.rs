//! Error types for `strata-core`.

use thiserror::Error;

use crate::import::ImportStatus;

#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown geographic level: {0:?}")]
  UnknownGeographicLevel(String),

  #[error("unknown time identifier: {0:?}")]
  UnknownTimeIdentifier(String),

  #[error("invalid time period {period:?} for {identifier}")]
  InvalidTimePeriod { period: String, identifier: String },

  #[error("illegal import transition {from} -> {to}")]
  IllegalTransition { from: ImportStatus, to: ImportStatus },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
