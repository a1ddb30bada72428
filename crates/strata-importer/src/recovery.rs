//! Resuming imports interrupted by a crash or redeploy.
//!
//! A pass holds the write half of the worker gate, so no message is being
//! handled while it runs and it is the only writer of the work queues. It
//! purges both work queues, then re-derives each unfinished import's next
//! messages from its persisted status and the batch files left in storage.
//!
//! | Status | Batch files | Action |
//! |---|---|---|
//! | `QUEUED` | | resend the original message |
//! | `PROCESSING_ARCHIVE`, `VALIDATE_AND_IMPORT_META` | | restart |
//! | `SPLIT` | none, no rows imported | restart |
//! | `SPLIT` | some | resume the split; it skips files already written |
//! | `IMPORT_OBSERVATIONS` | some remaining | one message per remaining file |
//! | `IMPORT_OBSERVATIONS` | none, every batch recorded | promote to `FINALIZE` |
//! | `IMPORT_OBSERVATIONS` | none, batches missing | restart |
//! | `FINALIZE` | | republish the finalize message |

use std::{collections::BTreeSet, sync::Arc};

use serde::Serialize;
use strata_core::{
  blob::{BlobStore, batch_no_from_path, batch_prefix, data_path},
  import::{ImportRecord, ImportStatus},
  message::{ImportObservationsMessage, QueueName},
  queue::MessageQueue,
  store::StatStore,
};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  coordinator::{Coordinator, batch_source, phase_message},
};

/// Held for reading while a worker handles a message, and for writing by a
/// recovery pass.
pub type Gate = Arc<RwLock<()>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryAction {
  /// Send the original `QUEUED` message again.
  Resend,
  /// Reset to `QUEUED`, discard partial work and start over.
  Restart,
  /// Republish the `SPLIT` message.
  ResumeSplit,
  /// One batch message per listed batch.
  Requeue(Vec<u32>),
  /// Every batch is recorded; move on to `FINALIZE`.
  Promote,
  /// Republish the message for the current status.
  Republish(ImportStatus),
  Skip,
}

/// Decide what to do with an unfinished import. `remaining` are batches with
/// a file in storage and no import record; `imported` are recorded batches.
pub fn classify(
  record: &ImportRecord,
  remaining: &BTreeSet<u32>,
  imported: &BTreeSet<u32>,
) -> RecoveryAction {
  use ImportStatus::*;

  match record.status {
    Queued => RecoveryAction::Resend,
    ProcessingArchive | ValidateAndImportMeta => RecoveryAction::Restart,
    Split if remaining.is_empty() && record.imported_rows == 0 => RecoveryAction::Restart,
    Split => RecoveryAction::ResumeSplit,
    ImportObservations if !remaining.is_empty() => {
      RecoveryAction::Requeue(remaining.iter().copied().collect())
    }
    ImportObservations if (1..=record.num_batches.max(1)).all(|n| imported.contains(&n)) => {
      RecoveryAction::Promote
    }
    ImportObservations => RecoveryAction::Restart,
    Finalize => RecoveryAction::Republish(Finalize),
    Complete | Failed | Cancelled => RecoveryAction::Skip,
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveredImport {
  pub import_id: Uuid,
  pub status:    ImportStatus,
  pub action:    RecoveryAction,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
  /// Ready messages dropped from the work queues.
  pub purged:  usize,
  pub imports: Vec<RecoveredImport>,
}

pub struct RecoveryHandler<S, Q, B> {
  coordinator: Arc<Coordinator<S, Q, B>>,
  store:       Arc<S>,
  queue:       Arc<Q>,
  blobs:       Arc<B>,
  gate:        Gate,
}

impl<S, Q, B> RecoveryHandler<S, Q, B>
where
  S: StatStore,
  Q: MessageQueue,
  B: BlobStore,
{
  pub fn new(
    coordinator: Arc<Coordinator<S, Q, B>>,
    store: Arc<S>,
    queue: Arc<Q>,
    blobs: Arc<B>,
    gate: Gate,
  ) -> Self {
    Self { coordinator, store, queue, blobs, gate }
  }

  /// One recovery pass. Waits for in-flight messages to finish first.
  pub async fn run(&self) -> Result<RecoveryReport> {
    let _exclusive = self.gate.write().await;

    let mut report = RecoveryReport::default();
    for queue in [QueueName::ImportsPending, QueueName::ImportsAvailable] {
      report.purged += self.queue.purge(queue).await.map_err(Error::queue)?;
    }

    let mut statuses = vec![ImportStatus::Queued];
    statuses.extend(ImportStatus::IN_FLIGHT);
    let records = self
      .store
      .list_imports(&statuses)
      .await
      .map_err(Error::store)?;

    for record in records {
      let action = self.recover(&record).await?;
      report.imports.push(RecoveredImport {
        import_id: record.import_id,
        status: record.status,
        action,
      });
    }

    info!(
      purged = report.purged,
      imports = report.imports.len(),
      "recovery pass complete"
    );
    Ok(report)
  }

  async fn recover(&self, record: &ImportRecord) -> Result<RecoveryAction> {
    let imported: BTreeSet<u32> = self
      .store
      .imported_batches(record.import_id)
      .await
      .map_err(Error::store)?
      .into_iter()
      .collect();
    let files = self.batch_files(record).await?;

    // Files of recorded batches are leftovers from a crash after commit.
    for batch_no in files.intersection(&imported) {
      if record.num_batches > 1 {
        let path = batch_source(record, *batch_no);
        self.blobs.delete(&path).await.map_err(Error::blob)?;
      }
    }
    let remaining: BTreeSet<u32> = files.difference(&imported).copied().collect();

    let action = classify(record, &remaining, &imported);
    info!(
      import_id = %record.import_id,
      status = %record.status,
      action = ?action,
      "recovering import"
    );

    match &action {
      RecoveryAction::Resend => {
        let message = record
          .last_message
          .clone()
          .unwrap_or_else(|| phase_message(record, ImportStatus::Queued));
        self
          .coordinator
          .publish(QueueName::ImportsPending, &message)
          .await?;
      }
      RecoveryAction::Restart => self.restart(record).await?,
      RecoveryAction::ResumeSplit => {
        self
          .coordinator
          .publish(QueueName::ImportsPending, &phase_message(record, ImportStatus::Split))
          .await?;
      }
      RecoveryAction::Requeue(batches) => {
        for batch_no in batches {
          let message = ImportObservationsMessage { import_id: record.import_id, batch_no: *batch_no };
          self
            .coordinator
            .publish(QueueName::ImportsAvailable, &message)
            .await?;
        }
      }
      RecoveryAction::Promote => self.coordinator.promote_if_done(record.import_id).await?,
      RecoveryAction::Republish(stage) => {
        self
          .coordinator
          .publish(QueueName::ImportsPending, &phase_message(record, *stage))
          .await?;
      }
      RecoveryAction::Skip => {}
    }
    Ok(action)
  }

  /// Batch numbers with a readable file in storage.
  async fn batch_files(&self, record: &ImportRecord) -> Result<BTreeSet<u32>> {
    if record.num_batches > 1 {
      let prefix = batch_prefix(record.release_id, record.import_id, &record.data_file_name);
      let paths = self.blobs.list(&prefix).await.map_err(Error::blob)?;
      return Ok(paths.iter().filter_map(|p| batch_no_from_path(p)).collect());
    }
    let source = data_path(record.release_id, record.import_id, &record.data_file_name);
    let found = self.blobs.get(&source).await.map_err(Error::blob)?;
    Ok(if found.is_some() && record.num_batches == 1 { BTreeSet::from([1]) } else { BTreeSet::new() })
  }

  async fn restart(&self, record: &ImportRecord) -> Result<()> {
    if !self
      .store
      .restart_import(record.import_id)
      .await
      .map_err(Error::store)?
    {
      warn!(import_id = %record.import_id, "import finished before it could be restarted");
      return Ok(());
    }

    let prefix = batch_prefix(record.release_id, record.import_id, &record.data_file_name);
    for path in self.blobs.list(&prefix).await.map_err(Error::blob)? {
      self.blobs.delete(&path).await.map_err(Error::blob)?;
    }

    let message = record
      .last_message
      .as_ref()
      .map(|m| m.at_stage(ImportStatus::Queued))
      .unwrap_or_else(|| phase_message(record, ImportStatus::Queued));
    self.coordinator.publish(QueueName::ImportsPending, &message).await
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;

  fn record(status: ImportStatus, num_batches: u32, imported_rows: u64) -> ImportRecord {
    ImportRecord {
      import_id: Uuid::new_v4(),
      subject_id: Uuid::new_v4(),
      release_id: Uuid::new_v4(),
      data_file_name: "absence.csv".into(),
      meta_file_name: "absence.meta.csv".into(),
      status,
      rows_per_batch: 10,
      total_rows: u64::from(num_batches) * 10,
      num_batches,
      imported_rows,
      completed_batches: 0,
      geographic_levels: BTreeSet::new(),
      data_columns: vec![],
      last_message: None,
      errors: vec![],
      checksum: None,
      created_at: Utc::now(),
      updated_at: Utc::now(),
    }
  }

  fn set(batches: &[u32]) -> BTreeSet<u32> { batches.iter().copied().collect() }

  #[test]
  fn early_phases_restart() {
    for status in [ImportStatus::ProcessingArchive, ImportStatus::ValidateAndImportMeta] {
      assert_eq!(classify(&record(status, 0, 0), &set(&[]), &set(&[])), RecoveryAction::Restart);
    }
    assert_eq!(
      classify(&record(ImportStatus::Queued, 0, 0), &set(&[]), &set(&[])),
      RecoveryAction::Resend
    );
  }

  #[test]
  fn two_of_five_remaining_requeues_exactly_two() {
    let r = record(ImportStatus::ImportObservations, 5, 30);
    assert_eq!(
      classify(&r, &set(&[2, 5]), &set(&[1, 3, 4])),
      RecoveryAction::Requeue(vec![2, 5])
    );
  }

  #[test]
  fn no_files_and_no_rows_means_never_past_validation() {
    for status in [ImportStatus::Split, ImportStatus::ImportObservations] {
      assert_eq!(classify(&record(status, 5, 0), &set(&[]), &set(&[])), RecoveryAction::Restart);
    }
  }

  #[test]
  fn split_with_files_resumes() {
    let r = record(ImportStatus::Split, 5, 0);
    assert_eq!(classify(&r, &set(&[1, 2]), &set(&[])), RecoveryAction::ResumeSplit);
  }

  #[test]
  fn fully_imported_batches_promote() {
    let r = record(ImportStatus::ImportObservations, 3, 30);
    assert_eq!(classify(&r, &set(&[]), &set(&[1, 2, 3])), RecoveryAction::Promote);
    assert_eq!(classify(&r, &set(&[]), &set(&[1, 3])), RecoveryAction::Restart);
  }

  #[test]
  fn finalize_republishes_and_terminal_skips() {
    assert_eq!(
      classify(&record(ImportStatus::Finalize, 3, 30), &set(&[]), &set(&[1, 2, 3])),
      RecoveryAction::Republish(ImportStatus::Finalize)
    );
    for status in [ImportStatus::Complete, ImportStatus::Failed, ImportStatus::Cancelled] {
      assert_eq!(classify(&record(status, 3, 30), &set(&[]), &set(&[])), RecoveryAction::Skip);
    }
  }
}
