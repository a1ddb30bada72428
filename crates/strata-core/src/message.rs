//! Queue names and message bodies.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};
use uuid::Uuid;

use crate::import::ImportStatus;

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
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum QueueName {
  /// Batches ready to import.
  ImportsAvailable,
  /// Files moving through the coordinator phases.
  ImportsPending,
  /// Recovery trigger.
  RestartImports,
}

/// A whole-file phase request, addressed to the `stage` the import is
/// expected to be in. Delivery when the persisted status differs is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMessage {
  pub import_id:      Uuid,
  pub subject_id:     Uuid,
  pub data_file_name: String,
  pub meta_file_name: String,
  pub release:        Uuid,
  pub stage:          ImportStatus,
  pub batch_no:       u32,
  pub num_batches:    u32,
  pub rows_per_batch: u32,
  pub total_rows:     u64,
}

impl ImportMessage {
  /// The same request addressed to a later stage.
  pub fn at_stage(&self, stage: ImportStatus) -> Self {
    Self { stage, ..self.clone() }
  }
}

/// Signals that one batch of an import is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportObservationsMessage {
  pub import_id: Uuid,
  pub batch_no:  u32,
}

/// Asks the recovery handler to run a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartImportsMessage {
  pub requested_by: Option<String>,
}
