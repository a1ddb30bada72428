//! Observations: the fact rows of a subject.
//!
//! An observation belongs to exactly one subject, location and time period
//! and carries a map of indicator id to value. Values are kept as the exact
//! strings found in the source file so suppression symbols (`c`, `x`, `z`)
//! survive a round trip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  dimension::{GeographicLevel, Location},
  time::TimePeriod,
};

/// Input to [`crate::store::StatStore::import_batch`]. The observation id is
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewObservation {
  pub subject_id:       Uuid,
  pub location_id:      Uuid,
  pub geographic_level: GeographicLevel,
  pub time_period:      TimePeriod,
  /// 1-based data row number within the source file.
  pub csv_row:          u64,
  pub filter_item_ids:  Vec<Uuid>,
  pub measures:         BTreeMap<Uuid, String>,
}

/// One batch of rows, written atomically together with its batch record.
#[derive(Debug, Clone)]
pub struct ObservationBatch {
  pub import_id:    Uuid,
  pub batch_no:     u32,
  pub subject_id:   Uuid,
  pub observations: Vec<NewObservation>,
}

/// What happened when a batch was offered to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
  /// Rows were written and the batch recorded.
  Imported { rows: u64 },
  /// The batch had already been recorded; nothing was written.
  AlreadyImported,
  /// The import left the observation phase (cancelled, failed, restarted)
  /// before commit; nothing was written.
  Rejected { status: crate::import::ImportStatus },
}

/// A query result row, tagged with its resolved dimensions for client-side
/// pivoting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationRow {
  pub observation_id:   Uuid,
  pub geographic_level: GeographicLevel,
  pub location:         Location,
  pub time_period:      TimePeriod,
  pub filters:          Vec<Uuid>,
  /// Requested indicator values only.
  pub values:           BTreeMap<Uuid, String>,
}
