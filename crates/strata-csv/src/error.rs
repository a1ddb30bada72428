//! Error types for the strata-csv codec.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One problem with one row (or with the header, when `row` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
  /// 1-based data row number; `None` for file-level problems.
  pub row:     Option<u64>,
  pub column:  Option<String>,
  pub message: String,
}

impl RowError {
  pub fn header(message: impl Into<String>) -> Self {
    Self { row: None, column: None, message: message.into() }
  }

  pub fn column(column: impl Into<String>, message: impl Into<String>) -> Self {
    Self { row: None, column: Some(column.into()), message: message.into() }
  }

  pub fn at(row: u64, column: Option<&str>, message: impl Into<String>) -> Self {
    Self {
      row:     Some(row),
      column:  column.map(str::to_owned),
      message: message.into(),
    }
  }
}

impl fmt::Display for RowError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match (self.row, &self.column) {
      (Some(row), Some(col)) => write!(f, "row {row}, column {col}: {}", self.message),
      (Some(row), None) => write!(f, "row {row}: {}", self.message),
      (None, Some(col)) => write!(f, "column {col}: {}", self.message),
      (None, None) => f.write_str(&self.message),
    }
  }
}

impl std::error::Error for RowError {}

#[derive(Debug, Error)]
pub enum Error {
  #[error("file has no header row")]
  MissingHeader,

  #[error("file failed validation with {} error(s)", .0.len())]
  Invalid(Vec<RowError>),

  #[error("CSV error: {0}")]
  Csv(#[from] csv::Error),

  #[error("CSV writer error: {0}")]
  Write(String),
}

impl Error {
  /// The row-level detail, if this is a validation failure.
  pub fn row_errors(&self) -> Vec<RowError> {
    match self {
      Self::Invalid(errors) => errors.clone(),
      other => vec![RowError::header(other.to_string())],
    }
  }
}

impl<W> From<csv::IntoInnerError<W>> for Error {
  fn from(err: csv::IntoInnerError<W>) -> Self { Self::Write(err.error().to_string()) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
