//! Error type for `strata-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] strata_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored enum column held a value this version does not recognise.
  #[error("unrecognised {kind} value: {value:?}")]
  Decode { kind: &'static str, value: String },

  #[error("import not found: {0}")]
  ImportNotFound(uuid::Uuid),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
