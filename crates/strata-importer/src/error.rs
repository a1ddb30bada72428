//! Error type for `strata-importer`.

use strata_core::import::ImportErrorEntry;
use strata_csv::RowError;
use thiserror::Error;
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  /// Rows or headers that failed validation. Nothing was committed.
  #[error("validation failed with {} error(s)", .0.len())]
  Validation(Vec<RowError>),

  #[error("csv error: {0}")]
  Csv(#[from] strata_csv::Error),

  #[error("core error: {0}")]
  Core(#[from] strata_core::Error),

  #[error("malformed message: {0}")]
  Message(#[from] serde_json::Error),

  #[error("store error: {0}")]
  Store(#[source] BoxError),

  #[error("blob error: {0}")]
  Blob(#[source] BoxError),

  #[error("queue error: {0}")]
  Queue(#[source] BoxError),

  #[error("import not found: {0}")]
  ImportNotFound(Uuid),

  #[error("subject not found: {0}")]
  SubjectNotFound(Uuid),

  #[error("missing blob: {0}")]
  MissingBlob(String),

  #[error("only {completed} of {expected} batches recorded at finalize")]
  IncompleteBatches { completed: u32, expected: u32 },

  #[error("{imported} rows imported but the data file has {expected}")]
  RowCountMismatch { imported: u64, expected: u64 },
}

impl Error {
  pub fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self { Self::Store(Box::new(e)) }

  pub fn blob(e: impl std::error::Error + Send + Sync + 'static) -> Self { Self::Blob(Box::new(e)) }

  pub fn queue(e: impl std::error::Error + Send + Sync + 'static) -> Self { Self::Queue(Box::new(e)) }

  /// Storage and transport failures, retried by redelivery. Everything else
  /// fails the import.
  pub fn is_transient(&self) -> bool { matches!(self, Self::Store(_) | Self::Blob(_) | Self::Queue(_)) }

  /// The structured entries to persist against an import for this error.
  pub fn entries(&self, batch_no: Option<u32>) -> Vec<ImportErrorEntry> {
    match self {
      Self::Validation(errors) => errors.iter().map(|e| entry(e, batch_no)).collect(),
      Self::Csv(e) => e.row_errors().iter().map(|e| entry(e, batch_no)).collect(),
      other => vec![ImportErrorEntry { batch_no, ..ImportErrorEntry::new(other.to_string()) }],
    }
  }
}

fn entry(error: &RowError, batch_no: Option<u32>) -> ImportErrorEntry {
  ImportErrorEntry {
    row: error.row,
    column: error.column.clone(),
    batch_no,
    ..ImportErrorEntry::new(error.message.clone())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
