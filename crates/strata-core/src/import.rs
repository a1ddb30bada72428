//! Import lifecycle: the per-file status machine and its persisted record.
//!
//! ```text
//! QUEUED → PROCESSING_ARCHIVE → VALIDATE_AND_IMPORT_META → SPLIT
//!        → IMPORT_OBSERVATIONS → FINALIZE → COMPLETE
//! ```
//!
//! `FAILED` and `CANCELLED` are absorbing and reachable from every
//! non-terminal status. The only backwards edge is an explicit restart to
//! `QUEUED`, issued by the recovery pass.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};
use uuid::Uuid;

use crate::{Error, Result, dimension::GeographicLevel, message::ImportMessage};

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  AsRefStr,
  EnumString,
  EnumIter,
  strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
  Queued,
  ProcessingArchive,
  ValidateAndImportMeta,
  Split,
  ImportObservations,
  Finalize,
  Complete,
  Failed,
  Cancelled,
}

impl ImportStatus {
  /// Statuses a running pipeline passes through, in order.
  pub const PIPELINE: [ImportStatus; 7] = [
    Self::Queued,
    Self::ProcessingArchive,
    Self::ValidateAndImportMeta,
    Self::Split,
    Self::ImportObservations,
    Self::Finalize,
    Self::Complete,
  ];

  /// Statuses in which work is under way and a crash leaves it interrupted.
  pub const IN_FLIGHT: [ImportStatus; 5] = [
    Self::ProcessingArchive,
    Self::ValidateAndImportMeta,
    Self::Split,
    Self::ImportObservations,
    Self::Finalize,
  ];

  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
  }

  fn position(&self) -> Option<usize> { Self::PIPELINE.iter().position(|s| s == self) }

  /// The status that follows this one on success, if any.
  pub fn next(&self) -> Option<ImportStatus> {
    self.position().and_then(|i| Self::PIPELINE.get(i + 1)).copied()
  }

  /// Forward-only transitions: one step along the pipeline, or into an
  /// absorbing failure state from any non-terminal status.
  pub fn can_transition_to(&self, to: ImportStatus) -> bool {
    if self.is_terminal() {
      return false;
    }
    match to {
      Self::Failed | Self::Cancelled => true,
      other => self.next() == Some(other),
    }
  }

  pub fn check_transition(&self, to: ImportStatus) -> Result<()> {
    if self.can_transition_to(to) {
      Ok(())
    } else {
      Err(Error::IllegalTransition { from: *self, to })
    }
  }

  /// Fixed progress estimate used before batch counts are known.
  pub fn weight(&self) -> f64 {
    match self {
      Self::Queued => 0.0,
      Self::ProcessingArchive => 5.0,
      Self::ValidateAndImportMeta => 10.0,
      Self::Split => 15.0,
      Self::ImportObservations => 20.0,
      Self::Finalize => 95.0,
      Self::Complete => 100.0,
      Self::Failed | Self::Cancelled => 0.0,
    }
  }
}

// ─── Errors recorded against an import ───────────────────────────────────────

/// A structured error persisted on the import record and surfaced through
/// status polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportErrorEntry {
  pub message:    String,
  /// Data row number (1-based), when the error is tied to a row.
  pub row:        Option<u64>,
  pub column:     Option<String>,
  pub batch_no:   Option<u32>,
  pub created_at: DateTime<Utc>,
}

impl ImportErrorEntry {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message:    message.into(),
      row:        None,
      column:     None,
      batch_no:   None,
      created_at: Utc::now(),
    }
  }
}

// ─── Record ──────────────────────────────────────────────────────────────────

/// Tracks one data file's import. Created on submission, advanced by each
/// phase, and superseded by a new record rather than edited when the file is
/// replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
  pub import_id:         Uuid,
  pub subject_id:        Uuid,
  pub release_id:        Uuid,
  pub data_file_name:    String,
  pub meta_file_name:    String,
  pub status:            ImportStatus,
  pub rows_per_batch:    u32,
  pub total_rows:        u64,
  /// Fixed once computed by the meta phase; 0 until then.
  pub num_batches:       u32,
  pub imported_rows:     u64,
  /// Count of distinct batches recorded as imported.
  pub completed_batches: u32,
  pub geographic_levels: BTreeSet<GeographicLevel>,
  /// Data-file header resolved during the meta phase; headerless batches are
  /// paired with it.
  pub data_columns:      Vec<String>,
  /// The original message that started the import, replayed on restart.
  pub last_message:      Option<ImportMessage>,
  pub errors:            Vec<ImportErrorEntry>,
  /// SHA-256 hex digest of the data file.
  pub checksum:          Option<String>,
  pub created_at:        DateTime<Utc>,
  pub updated_at:        DateTime<Utc>,
}

impl ImportRecord {
  /// Completed batches over total batches once known, else the fixed
  /// phase-weighted estimate.
  pub fn percent_complete(&self) -> f64 {
    match self.status {
      ImportStatus::ImportObservations if self.num_batches > 0 => {
        let ratio = f64::from(self.completed_batches.min(self.num_batches))
          / f64::from(self.num_batches);
        let lo = ImportStatus::ImportObservations.weight();
        let hi = ImportStatus::Finalize.weight();
        lo + ratio * (hi - lo)
      }
      other => other.weight(),
    }
  }
}

/// Input to [`crate::store::StatStore::create_import`].
#[derive(Debug, Clone)]
pub struct NewImport {
  pub import_id:      Uuid,
  pub subject_id:     Uuid,
  pub release_id:     Uuid,
  pub data_file_name: String,
  pub meta_file_name: String,
  pub message:        ImportMessage,
}

/// Counts written by the meta phase via
/// [`crate::store::StatStore::update_import`].
#[derive(Debug, Clone, Default)]
pub struct ImportUpdate {
  pub rows_per_batch:    u32,
  pub total_rows:        u64,
  pub num_batches:       u32,
  pub geographic_levels: BTreeSet<GeographicLevel>,
  pub data_columns:      Vec<String>,
  pub checksum:          Option<String>,
}

/// Aggregates recomputed when an import finalizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
  pub subject_id:        Uuid,
  pub observation_count: u64,
  pub geographic_levels: Vec<GeographicLevel>,
  pub first_period:      Option<crate::time::TimePeriod>,
  pub last_period:       Option<crate::time::TimePeriod>,
}

/// Result of [`crate::store::StatStore::finalize_import`].
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
  Completed(SubjectSummary),
  /// The import was not in `FINALIZE`; nothing was done.
  NotInFinalize(ImportStatus),
  /// Fewer batches are recorded than `num_batches`.
  Incomplete { completed: u32, expected: u32 },
  /// Every batch is recorded but the imported rows do not add up to
  /// `total_rows`. The import stays in `FINALIZE`.
  RowCountMismatch { imported: u64, expected: u64 },
  /// Another finalize holds the named lock.
  Locked,
}
