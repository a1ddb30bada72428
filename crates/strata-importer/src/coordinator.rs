//! The import state machine: one handler per phase, each addressed by the
//! stage it expects the import to be in.
//!
//! Every handler re-reads the persisted status first and does nothing when it
//! differs from the message's stage, so a duplicate or late delivery is a
//! no-op. A phase ends with a compare-and-set to the next status, and only the
//! caller that wins the swap publishes the next message.

use std::{collections::BTreeSet, sync::Arc};

use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use strata_core::{
  blob::{BlobStore, batch_path, data_path},
  dimension::{NewFilter, NewIndicator},
  import::{
    FinalizeOutcome, ImportErrorEntry, ImportRecord, ImportStatus, ImportUpdate, NewImport,
  },
  message::{ImportMessage, ImportObservationsMessage, QueueName},
  observation::BatchOutcome,
  queue::MessageQueue,
  store::StatStore,
};
use strata_csv::{DataHeader, RowError, RowParser, batch_count, parse_meta};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  Dimensions, Error, ImporterConfig, Result, observations::ObservationImporter,
  splitter::Splitter,
};

// ─── Requests and views ──────────────────────────────────────────────────────

/// A data file and its meta file, as uploaded.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
  pub release_id:     Uuid,
  pub subject_name:   String,
  pub data_file_name: String,
  pub meta_file_name: String,
  pub data:           Bytes,
  pub meta:           Bytes,
}

/// What status polling returns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
  pub import_id:         Uuid,
  pub subject_id:        Uuid,
  pub status:            ImportStatus,
  pub percent_complete:  f64,
  pub total_rows:        u64,
  pub imported_rows:     u64,
  pub num_batches:       u32,
  pub completed_batches: u32,
  pub errors:            Vec<ImportErrorEntry>,
}

impl From<&ImportRecord> for ImportProgress {
  fn from(record: &ImportRecord) -> Self {
    Self {
      import_id:         record.import_id,
      subject_id:        record.subject_id,
      status:            record.status,
      percent_complete:  record.percent_complete(),
      total_rows:        record.total_rows,
      imported_rows:     record.imported_rows,
      num_batches:       record.num_batches,
      completed_batches: record.completed_batches,
      errors:            record.errors.clone(),
    }
  }
}

/// The whole-file message for `record` at `stage`, carrying its current
/// counts.
pub fn phase_message(record: &ImportRecord, stage: ImportStatus) -> ImportMessage {
  ImportMessage {
    import_id: record.import_id,
    subject_id: record.subject_id,
    data_file_name: record.data_file_name.clone(),
    meta_file_name: record.meta_file_name.clone(),
    release: record.release_id,
    stage,
    batch_no: 1,
    num_batches: record.num_batches,
    rows_per_batch: record.rows_per_batch,
    total_rows: record.total_rows,
  }
}

/// Where batch `batch_no` of `record` is read from. A single-batch import
/// reads the uploaded file itself.
pub fn batch_source(record: &ImportRecord, batch_no: u32) -> String {
  if record.num_batches <= 1 {
    data_path(record.release_id, record.import_id, &record.data_file_name)
  } else {
    batch_path(record.release_id, record.import_id, &record.data_file_name, batch_no)
  }
}

fn check_file_name(field: &str, name: &str) -> Result<()> {
  if name.is_empty() || name.contains('/') || name.contains("..") {
    return Err(Error::Validation(vec![RowError::column(field, "invalid file name")]));
  }
  Ok(())
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

pub struct Coordinator<S, Q, B> {
  store:      Arc<S>,
  queue:      Arc<Q>,
  blobs:      Arc<B>,
  dimensions: Arc<Dimensions>,
  importer:   ObservationImporter<S>,
  splitter:   Splitter<S, B>,
  config:     ImporterConfig,
}

impl<S, Q, B> Coordinator<S, Q, B>
where
  S: StatStore,
  Q: MessageQueue,
  B: BlobStore,
{
  pub fn new(
    store: Arc<S>,
    queue: Arc<Q>,
    blobs: Arc<B>,
    dimensions: Arc<Dimensions>,
    config: ImporterConfig,
  ) -> Self {
    Self {
      importer: ObservationImporter::new(store.clone(), dimensions.clone()),
      splitter: Splitter::new(store.clone(), blobs.clone()),
      store,
      queue,
      blobs,
      dimensions,
      config,
    }
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  async fn require(&self, id: Uuid) -> Result<ImportRecord> {
    self
      .store
      .get_import(id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::ImportNotFound(id))
  }

  pub(crate) async fn publish<T: Serialize>(&self, queue: QueueName, body: &T) -> Result<()> {
    let body = serde_json::to_value(body)?;
    self.queue.send(queue, body).await.map_err(Error::queue)
  }

  /// Compare-and-set `from → to`. `false` means another worker already moved
  /// the import on.
  async fn advance(&self, record: &ImportRecord, from: ImportStatus, to: ImportStatus) -> Result<bool> {
    let moved = self
      .store
      .transition_import(record.import_id, from, to)
      .await
      .map_err(Error::store)?;
    if moved {
      info!(import_id = %record.import_id, %from, %to, "import advanced");
    } else {
      warn!(import_id = %record.import_id, %from, %to, "transition lost to another worker");
    }
    Ok(moved)
  }

  // ── Contract ──────────────────────────────────────────────────────────

  /// Store the uploaded files, create the subject and its import record, and
  /// queue the first phase. The files are written first so a storage failure
  /// leaves no subject behind.
  pub async fn submit(&self, request: SubmitRequest) -> Result<ImportRecord> {
    check_file_name("dataFileName", &request.data_file_name)?;
    check_file_name("metaFileName", &request.meta_file_name)?;

    let release = request.release_id;
    let import_id = Uuid::new_v4();
    for (name, data) in [
      (&request.data_file_name, request.data),
      (&request.meta_file_name, request.meta),
    ] {
      self
        .blobs
        .put(&data_path(release, import_id, name), data)
        .await
        .map_err(Error::blob)?;
    }

    let subject = self
      .store
      .create_subject(release, request.subject_name)
      .await
      .map_err(Error::store)?;

    let message = ImportMessage {
      import_id,
      subject_id: subject.subject_id,
      data_file_name: request.data_file_name,
      meta_file_name: request.meta_file_name,
      release,
      stage: ImportStatus::Queued,
      batch_no: 1,
      num_batches: 0,
      rows_per_batch: self.config.row_limit_per_batch,
      total_rows: 0,
    };
    let record = self
      .store
      .create_import(NewImport {
        import_id,
        subject_id:     message.subject_id,
        release_id:     release,
        data_file_name: message.data_file_name.clone(),
        meta_file_name: message.meta_file_name.clone(),
        message:        message.clone(),
      })
      .await
      .map_err(Error::store)?;

    self.publish(QueueName::ImportsPending, &message).await?;
    info!(import_id = %record.import_id, subject_id = %record.subject_id, "import submitted");
    Ok(record)
  }

  pub async fn status(&self, id: Uuid) -> Result<ImportProgress> {
    Ok(ImportProgress::from(&self.require(id).await?))
  }

  pub async fn update(&self, id: Uuid, update: ImportUpdate) -> Result<()> {
    self.store.update_import(id, update).await.map_err(Error::store)
  }

  /// Terminal; never re-queues.
  pub async fn fail_import(&self, id: Uuid, errors: Vec<ImportErrorEntry>) -> Result<bool> {
    let count = errors.len();
    let failed = self.store.fail_import(id, errors).await.map_err(Error::store)?;
    if failed {
      error!(import_id = %id, errors = count, "import failed");
    }
    Ok(failed)
  }

  pub async fn cancel(&self, id: Uuid) -> Result<bool> {
    self.require(id).await?;
    let cancelled = self.store.cancel_import(id).await.map_err(Error::store)?;
    if cancelled {
      info!(import_id = %id, "import cancelled");
    }
    Ok(cancelled)
  }

  // ── imports-pending ───────────────────────────────────────────────────

  /// Run the whole-file phase `message` is addressed to. Failures other than
  /// transient storage errors fail the import.
  pub async fn handle_pending(&self, message: ImportMessage) -> Result<()> {
    let Some(record) = self
      .store
      .get_import(message.import_id)
      .await
      .map_err(Error::store)?
    else {
      warn!(import_id = %message.import_id, "message for unknown import dropped");
      return Ok(());
    };
    if record.status != message.stage {
      warn!(
        import_id = %record.import_id,
        expected = %message.stage,
        status = %record.status,
        "stale phase message ignored"
      );
      return Ok(());
    }

    match self.run_phase(&record).await {
      Err(e) if !e.is_transient() => {
        self.fail_import(record.import_id, e.entries(None)).await?;
        Ok(())
      }
      other => other,
    }
  }

  async fn run_phase(&self, record: &ImportRecord) -> Result<()> {
    use ImportStatus::*;

    match record.status {
      Queued => {
        if self.advance(record, Queued, ProcessingArchive).await? {
          self
            .publish(QueueName::ImportsPending, &phase_message(record, ProcessingArchive))
            .await?;
        }
      }
      ProcessingArchive => {
        for name in [&record.data_file_name, &record.meta_file_name] {
          let path = data_path(record.release_id, record.import_id, name);
          let found = self.blobs.get(&path).await.map_err(Error::blob)?;
          if found.is_none() {
            return Err(Error::MissingBlob(path));
          }
        }
        if self.advance(record, ProcessingArchive, ValidateAndImportMeta).await? {
          self
            .publish(QueueName::ImportsPending, &phase_message(record, ValidateAndImportMeta))
            .await?;
        }
      }
      ValidateAndImportMeta => {
        let update = self.import_meta(record).await?;
        self.update(record.import_id, update).await?;
        let record = self.require(record.import_id).await?;
        if self.advance(&record, ValidateAndImportMeta, Split).await? {
          self
            .publish(QueueName::ImportsPending, &phase_message(&record, Split))
            .await?;
        }
      }
      Split => {
        let pending = self.splitter.split(record).await?;
        if self.advance(record, Split, ImportObservations).await? {
          for batch_no in &pending {
            self
              .publish(
                QueueName::ImportsAvailable,
                &ImportObservationsMessage { import_id: record.import_id, batch_no: *batch_no },
              )
              .await?;
          }
          if pending.is_empty() {
            self.promote_if_done(record.import_id).await?;
          }
        }
      }
      Finalize => self.finalize(record).await?,
      other => {
        warn!(import_id = %record.import_id, status = %other, "no whole-file phase for status");
      }
    }
    Ok(())
  }

  /// Validate the data file against its meta file, create the subject's
  /// filters and indicators, and work out the batch layout.
  async fn import_meta(&self, record: &ImportRecord) -> Result<ImportUpdate> {
    let (release, import) = (record.release_id, record.import_id);
    let data = self.read(&data_path(release, import, &record.data_file_name)).await?;
    let meta = self.read(&data_path(release, import, &record.meta_file_name)).await?;

    let schema = parse_meta(&meta)?;
    let header = DataHeader::read(&data)?;
    header.validate_against(&schema).map_err(Error::Validation)?;
    let parser = RowParser::new(header.clone(), &schema).map_err(Error::Validation)?;
    let (rows, errors) = parser.parse_all(&data, true, 1)?;
    if !errors.is_empty() {
      return Err(Error::Validation(errors));
    }

    let subject_id = record.subject_id;
    let store = self.store.as_ref();
    for f in &schema.filters {
      let input = NewFilter {
        subject_id,
        name: f.name.clone(),
        label: f.label.clone(),
        hint: f.hint.clone(),
        grouping_column: f.grouping_column.clone(),
      };
      self
        .dimensions
        .filters
        .get_or_create_and_cache((subject_id, f.name.clone()), || async move {
          store
            .get_or_create_filter(input)
            .await
            .map(|f| f.filter_id)
            .map_err(Error::store)
        })
        .await?;
    }
    for i in &schema.indicators {
      let input = NewIndicator {
        subject_id,
        group_label: i.group.clone(),
        name: i.name.clone(),
        label: i.label.clone(),
        unit: i.unit.clone(),
        decimal_places: i.decimal_places,
      };
      self
        .dimensions
        .indicators
        .get_or_create_and_cache((subject_id, i.name.clone()), || async move {
          store
            .get_or_create_indicator(input)
            .await
            .map(|i| i.indicator_id)
            .map_err(Error::store)
        })
        .await?;
    }

    let total_rows = rows.len() as u64;
    let rows_per_batch = self.config.row_limit_per_batch.max(1);
    let geographic_levels: BTreeSet<_> = rows.iter().map(|r| r.geographic_level).collect();
    let num_batches = batch_count(total_rows, rows_per_batch);
    debug!(
      import_id = %record.import_id,
      total_rows,
      num_batches,
      filters = schema.filters.len(),
      indicators = schema.indicators.len(),
      "meta imported"
    );

    Ok(ImportUpdate {
      rows_per_batch,
      total_rows,
      num_batches,
      geographic_levels,
      data_columns: header.columns().to_vec(),
      checksum: Some(hex::encode(Sha256::digest(&data))),
    })
  }

  async fn read(&self, path: &str) -> Result<Bytes> {
    self
      .blobs
      .get(path)
      .await
      .map_err(Error::blob)?
      .ok_or_else(|| Error::MissingBlob(path.to_owned()))
  }

  async fn finalize(&self, record: &ImportRecord) -> Result<()> {
    match self
      .store
      .finalize_import(record.import_id)
      .await
      .map_err(Error::store)?
    {
      FinalizeOutcome::Completed(summary) => {
        info!(
          import_id = %record.import_id,
          observations = summary.observation_count,
          "import complete"
        );
        Ok(())
      }
      FinalizeOutcome::NotInFinalize(status) => {
        warn!(import_id = %record.import_id, %status, "finalize skipped");
        Ok(())
      }
      FinalizeOutcome::Locked => {
        debug!(import_id = %record.import_id, "finalize already running elsewhere");
        Ok(())
      }
      FinalizeOutcome::Incomplete { completed, expected } => {
        Err(Error::IncompleteBatches { completed, expected })
      }
      FinalizeOutcome::RowCountMismatch { imported, expected } => {
        Err(Error::RowCountMismatch { imported, expected })
      }
    }
  }

  // ── imports-available ─────────────────────────────────────────────────

  /// Import one batch. Safe to deliver any number of times, in any order.
  pub async fn handle_available(&self, message: ImportObservationsMessage) -> Result<()> {
    let ImportObservationsMessage { import_id, batch_no } = message;
    let Some(record) = self.store.get_import(import_id).await.map_err(Error::store)? else {
      warn!(%import_id, batch_no, "batch for unknown import dropped");
      return Ok(());
    };
    if record.status != ImportStatus::ImportObservations {
      warn!(%import_id, batch_no, status = %record.status, "batch delivered outside observation phase");
      return Ok(());
    }

    let source = batch_source(&record, batch_no);
    let Some(data) = self.blobs.get(&source).await.map_err(Error::blob)? else {
      let imported = self
        .store
        .imported_batches(import_id)
        .await
        .map_err(Error::store)?;
      if imported.contains(&batch_no) {
        debug!(%import_id, batch_no, "batch already imported and removed");
        return self.promote_if_done(import_id).await;
      }
      return Err(Error::MissingBlob(source));
    };

    let meta = self
      .store
      .subject_meta(record.subject_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::SubjectNotFound(record.subject_id))?;

    match self.importer.import_batch(&record, &meta, batch_no, &data).await {
      Ok(BatchOutcome::Imported { rows }) => {
        info!(%import_id, batch_no, rows, "batch imported");
        self.discard_batch(&record, batch_no).await?;
      }
      Ok(BatchOutcome::AlreadyImported) => {
        warn!(%import_id, batch_no, "duplicate batch delivery");
        self.discard_batch(&record, batch_no).await?;
      }
      Ok(BatchOutcome::Rejected { status }) => {
        warn!(%import_id, batch_no, %status, "batch rejected, import left observation phase");
        return Ok(());
      }
      Err(e @ (Error::Validation(_) | Error::Csv(_))) => {
        warn!(%import_id, batch_no, error = %e, "batch failed validation");
        self
          .store
          .record_import_errors(import_id, e.entries(Some(batch_no)))
          .await
          .map_err(Error::store)?;
        return Ok(());
      }
      Err(e) => return Err(e),
    }

    self.promote_if_done(import_id).await
  }

  /// Remove a batch's materialised file once it is recorded. The uploaded
  /// data file is never removed.
  async fn discard_batch(&self, record: &ImportRecord, batch_no: u32) -> Result<()> {
    if record.num_batches > 1 {
      let path = batch_path(record.release_id, record.import_id, &record.data_file_name, batch_no);
      self.blobs.delete(&path).await.map_err(Error::blob)?;
    }
    Ok(())
  }

  /// Move to `FINALIZE` once every batch is recorded. Of several workers
  /// finishing together, only the compare-and-set winner publishes.
  pub(crate) async fn promote_if_done(&self, import_id: Uuid) -> Result<()> {
    let record = self.require(import_id).await?;
    if record.status != ImportStatus::ImportObservations
      || record.completed_batches < record.num_batches.max(1)
    {
      return Ok(());
    }
    if self
      .advance(&record, ImportStatus::ImportObservations, ImportStatus::Finalize)
      .await?
    {
      self
        .publish(QueueName::ImportsPending, &phase_message(&record, ImportStatus::Finalize))
        .await?;
    }
    Ok(())
  }
}
