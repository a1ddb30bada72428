//! End-to-end pipeline tests over an in-memory SQLite store, the channel
//! queue and the in-memory blob store.

use std::{collections::BTreeMap, io, sync::Arc, time::Duration};

use bytes::Bytes;
use strata_core::{
  blob::BlobStore,
  dimension::SubjectMeta,
  import::ImportStatus,
  message::{ImportMessage, ImportObservationsMessage, QueueName},
  query::DataSetQuery,
  queue::MessageQueue,
  store::StatStore,
};
use strata_store_sqlite::SqliteStore;
use uuid::Uuid;

use crate::{
  ChannelQueue, ImporterConfig, MemoryBlobStore, Pipeline, RecoveryAction, fixtures::SeedSet,
};

type TestPipeline = Pipeline<SqliteStore, ChannelQueue, MemoryBlobStore>;

struct Harness {
  pipeline: TestPipeline,
  store:    Arc<SqliteStore>,
  blobs:    Arc<MemoryBlobStore>,
}

fn config() -> ImporterConfig {
  ImporterConfig {
    row_limit_per_batch: 10,
    workers:             3,
    max_delivery_count:  3,
    poll_interval_ms:    10,
  }
}

async fn harness() -> Harness {
  let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
  let blobs = Arc::new(MemoryBlobStore::new());
  let queue = Arc::new(ChannelQueue::new(3));
  let pipeline = Pipeline::new(store.clone(), queue, blobs.clone(), config());
  Harness { pipeline, store, blobs }
}

impl Harness {
  async fn submit(&self, set: &SeedSet) -> Uuid { self.submit_to(Uuid::new_v4(), set).await }

  async fn submit_to(&self, release: Uuid, set: &SeedSet) -> Uuid {
    let record = self
      .pipeline
      .coordinator
      .submit(set.submit_request(release))
      .await
      .unwrap();
    record.import_id
  }

  /// Handle one whole-file message. Returns `false` if there was none.
  async fn step_pending(&self) -> bool {
    let queue = self.pipeline.queue();
    let Some(d) = queue.receive(QueueName::ImportsPending, Duration::ZERO).await.unwrap() else {
      return false;
    };
    let message: ImportMessage = serde_json::from_value(d.body.clone()).unwrap();
    self.pipeline.coordinator.handle_pending(message).await.unwrap();
    queue.complete(&d).await.unwrap();
    true
  }

  /// Run whole-file phases until the batches are published, then take the
  /// batch messages off the queue so the test can deliver them itself.
  async fn split(&self) -> Vec<ImportObservationsMessage> {
    while self.step_pending().await {}
    let queue = self.pipeline.queue();
    let mut batches = Vec::new();
    while let Some(d) = queue
      .receive(QueueName::ImportsAvailable, Duration::ZERO)
      .await
      .unwrap()
    {
      batches.push(serde_json::from_value(d.body.clone()).unwrap());
      queue.complete(&d).await.unwrap();
    }
    batches
  }

  async fn deliver(&self, import_id: Uuid, batch_no: u32) {
    self
      .pipeline
      .coordinator
      .handle_available(ImportObservationsMessage { import_id, batch_no })
      .await
      .unwrap();
  }

  async fn status(&self, import_id: Uuid) -> crate::ImportProgress {
    self.pipeline.coordinator.status(import_id).await.unwrap()
  }

  /// Every row of the subject behind `import_id`, all indicators.
  async fn query_all(&self, import_id: Uuid) -> (u64, Vec<BTreeMap<Uuid, String>>, SubjectMeta) {
    let subject_id = self.status(import_id).await.subject_id;
    let meta = self.store.subject_meta(subject_id).await.unwrap().unwrap();
    let query = DataSetQuery::default().compile(&meta, 1, 1000, 1000).unwrap();
    let page = self.store.query_observations(&query).await.unwrap();
    (page.total_results, page.rows.into_iter().map(|r| r.values).collect(), meta)
  }
}

fn synthetic_enrolments(rows: u64) -> Vec<String> {
  let mut values: Vec<String> = (1..=rows)
    .map(|row| if row % 7 == 0 { "c".to_owned() } else { (row * 10).to_string() })
    .collect();
  values.sort();
  values
}

// ─── End to end ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn absence_file_reaches_complete() {
  let h = harness().await;
  let import_id = h.submit(&SeedSet::absence()).await;
  assert!(h.pipeline.run_until_idle().await.unwrap() >= 6);

  let progress = h.status(import_id).await;
  assert_eq!(progress.status, ImportStatus::Complete);
  assert_eq!(progress.percent_complete, 100.0);
  assert_eq!((progress.total_rows, progress.imported_rows), (3, 3));

  let (total, rows, meta) = h.query_all(import_id).await;
  assert_eq!(total, 3);
  assert_eq!(meta.indicators.len(), 1);
  assert!(rows.iter().all(|values| values.len() == 1));

  let mut values: Vec<&str> = rows.iter().flat_map(|v| v.values().map(String::as_str)).collect();
  values.sort();
  assert_eq!(values, vec!["4.0", "5.4", "c"]);
}

#[tokio::test]
async fn batches_in_any_order_with_duplicates_import_once() {
  let h = harness().await;
  let import_id = h.submit(&SeedSet::synthetic(45)).await;

  let batches = h.split().await;
  assert_eq!(batches.len(), 5);
  assert_eq!(h.status(import_id).await.status, ImportStatus::ImportObservations);

  for batch_no in [5, 3, 3, 1, 4, 2, 5, 1] {
    h.deliver(import_id, batch_no).await;
  }

  // Promotion published exactly one finalize message.
  let queue = h.pipeline.queue();
  assert_eq!(queue.len(QueueName::ImportsPending).await.unwrap(), 1);
  assert_eq!(h.status(import_id).await.status, ImportStatus::Finalize);

  h.pipeline.run_until_idle().await.unwrap();
  let progress = h.status(import_id).await;
  assert_eq!(progress.status, ImportStatus::Complete);
  assert_eq!((progress.imported_rows, progress.completed_batches), (45, 5));

  let (total, rows, meta) = h.query_all(import_id).await;
  assert_eq!(total, 45);

  // Values survive as their source strings.
  let enrolments = meta.indicators.iter().find(|i| i.name == "enrolments").unwrap().indicator_id;
  let mut values: Vec<String> = rows.iter().map(|v| v[&enrolments].clone()).collect();
  values.sort();
  assert_eq!(values, synthetic_enrolments(45));

  // Batch files are removed once recorded; the uploads stay.
  assert_eq!(h.blobs.len(), 2);
  let summary = h.store.subject_summary(meta.subject.subject_id).await.unwrap().unwrap();
  assert_eq!(summary.observation_count, 45);
}

#[tokio::test]
async fn redelivered_batch_adds_no_rows() {
  let h = harness().await;
  let import_id = h.submit(&SeedSet::synthetic(25)).await;
  assert_eq!(h.split().await.len(), 3);

  h.deliver(import_id, 1).await;
  h.deliver(import_id, 1).await;
  let progress = h.status(import_id).await;
  assert_eq!((progress.imported_rows, progress.completed_batches), (10, 1));

  h.deliver(import_id, 2).await;
  h.deliver(import_id, 3).await;
  h.pipeline.run_until_idle().await.unwrap();

  let (total, ..) = h.query_all(import_id).await;
  assert_eq!(total, 25);
}

#[tokio::test]
async fn same_file_name_twice_in_a_release_imports_both() {
  let h = harness().await;
  let release = Uuid::new_v4();
  let first = h.submit_to(release, &SeedSet::synthetic(45)).await;
  assert_eq!(h.split().await.len(), 5);
  h.deliver(first, 1).await;
  h.deliver(first, 2).await;

  // Same release and file names, different contents.
  let second = h.submit_to(release, &SeedSet::synthetic(25)).await;
  assert_eq!(h.split().await.len(), 3);
  for batch_no in 1..=3 {
    h.deliver(second, batch_no).await;
  }
  for batch_no in 3..=5 {
    h.deliver(first, batch_no).await;
  }
  h.pipeline.run_until_idle().await.unwrap();

  for (import_id, rows) in [(first, 45), (second, 25)] {
    let progress = h.status(import_id).await;
    assert_eq!(progress.status, ImportStatus::Complete, "{import_id}");
    assert_eq!((progress.total_rows, progress.imported_rows), (rows, rows));
    assert_eq!(h.query_all(import_id).await.0, rows);
  }
}

#[tokio::test]
async fn worker_pool_completes_an_import() {
  let h = harness().await;
  let import_id = h.submit(&SeedSet::synthetic(40)).await;
  let pool = h.pipeline.spawn_workers();
  assert_eq!(pool.len(), 3);

  let done = tokio::time::timeout(Duration::from_secs(10), async {
    loop {
      if h.status(import_id).await.status == ImportStatus::Complete {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await;
  pool.shutdown().await;

  assert!(done.is_ok(), "import did not complete");
  assert_eq!(h.query_all(import_id).await.0, 40);
}

// ─── Failure paths ───────────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_rows_fail_the_import_with_row_errors() {
  let h = harness().await;
  let mut set = SeedSet::absence();
  set.data = Bytes::from(
    "\
time_period,time_identifier,geographic_level,country_code,country_name,school_type,sess_overall_percent
201617,Academic year,National,E92000001,England,State-funded primary,4.0
201617,Academic year,Nowhere,E92000001,England,State-funded secondary,lots
",
  );
  let import_id = h.submit(&set).await;
  h.pipeline.run_until_idle().await.unwrap();

  let progress = h.status(import_id).await;
  assert_eq!(progress.status, ImportStatus::Failed);
  assert_eq!(progress.imported_rows, 0);
  let columns: Vec<_> = progress.errors.iter().filter_map(|e| e.column.as_deref()).collect();
  assert!(columns.contains(&"geographic_level"), "{columns:?}");
  assert!(columns.contains(&"sess_overall_percent"), "{columns:?}");
  assert!(progress.errors.iter().all(|e| e.row == Some(2)));
}

/// Refuses every write.
struct ReadOnlyBlobs;

impl BlobStore for ReadOnlyBlobs {
  type Error = io::Error;

  async fn put<'a>(&'a self, path: &'a str, _data: Bytes) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("read-only: {path}")))
  }

  async fn get<'a>(&'a self, _path: &'a str) -> io::Result<Option<Bytes>> { Ok(None) }

  async fn list<'a>(&'a self, _prefix: &'a str) -> io::Result<Vec<String>> { Ok(Vec::new()) }

  async fn delete<'a>(&'a self, _path: &'a str) -> io::Result<()> { Ok(()) }
}

#[tokio::test]
async fn failed_upload_leaves_nothing_behind() {
  let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
  let queue = Arc::new(ChannelQueue::new(3));
  let pipeline = Pipeline::new(store.clone(), queue.clone(), Arc::new(ReadOnlyBlobs), config());

  let release = Uuid::new_v4();
  let err = pipeline
    .coordinator
    .submit(SeedSet::absence().submit_request(release))
    .await
    .unwrap_err();
  assert!(matches!(err, crate::Error::Blob(_)), "{err}");
  assert!(store.release_subjects(release).await.unwrap().is_empty());
  assert_eq!(queue.len(QueueName::ImportsPending).await.unwrap(), 0);
}

#[tokio::test]
async fn missing_upload_fails_the_import() {
  let h = harness().await;
  let set = SeedSet::absence();
  let release = Uuid::new_v4();
  let import_id = h
    .pipeline
    .coordinator
    .submit(set.submit_request(release))
    .await
    .unwrap()
    .import_id;
  strata_core::blob::BlobStore::delete(
    h.blobs.as_ref(),
    &strata_core::blob::data_path(release, import_id, "absence.meta.csv"),
  )
  .await
  .unwrap();

  h.pipeline.run_until_idle().await.unwrap();
  let progress = h.status(import_id).await;
  assert_eq!(progress.status, ImportStatus::Failed);
  assert!(progress.errors[0].message.contains("absence.meta.csv"));
}

#[tokio::test]
async fn cancelled_import_takes_no_more_batches() {
  let h = harness().await;
  let import_id = h.submit(&SeedSet::synthetic(30)).await;
  h.split().await;

  h.deliver(import_id, 1).await;
  assert!(h.pipeline.coordinator.cancel(import_id).await.unwrap());
  h.deliver(import_id, 2).await;

  let progress = h.status(import_id).await;
  assert_eq!(progress.status, ImportStatus::Cancelled);
  assert_eq!(progress.imported_rows, 10);
  assert!(!h.pipeline.coordinator.cancel(import_id).await.unwrap());
}

#[tokio::test]
async fn stale_phase_messages_are_ignored() {
  let h = harness().await;
  let set = SeedSet::absence();
  let import_id = h.submit(&set).await;
  assert!(h.step_pending().await);
  assert_eq!(h.status(import_id).await.status, ImportStatus::ProcessingArchive);

  // A second copy of the original message arrives late.
  let record = h.store.get_import(import_id).await.unwrap().unwrap();
  let original = record.last_message.unwrap();
  h.pipeline.coordinator.handle_pending(original).await.unwrap();
  assert_eq!(h.status(import_id).await.status, ImportStatus::ProcessingArchive);
  assert_eq!(h.pipeline.queue().len(QueueName::ImportsPending).await.unwrap(), 1);
}

// ─── Recovery ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn recovery_requeues_only_remaining_batches() {
  let h = harness().await;
  let import_id = h.submit(&SeedSet::synthetic(50)).await;
  assert_eq!(h.split().await.len(), 5);

  // Three batches land, then the process dies and the other messages are lost.
  for batch_no in [1, 3, 4] {
    h.deliver(import_id, batch_no).await;
  }

  let report = h.pipeline.recovery.run().await.unwrap();
  let recovered = report.imports.iter().find(|r| r.import_id == import_id).unwrap();
  assert_eq!(recovered.action, RecoveryAction::Requeue(vec![2, 5]));
  assert_eq!(h.pipeline.queue().len(QueueName::ImportsAvailable).await.unwrap(), 2);

  h.pipeline.run_until_idle().await.unwrap();
  assert_eq!(h.status(import_id).await.status, ImportStatus::Complete);
  assert_eq!(h.query_all(import_id).await.0, 50);
}

#[tokio::test]
async fn recovery_restarts_an_import_stuck_in_validation() {
  let h = harness().await;
  let import_id = h.submit(&SeedSet::absence()).await;
  assert!(h.step_pending().await);
  assert!(h.step_pending().await);
  assert_eq!(h.status(import_id).await.status, ImportStatus::ValidateAndImportMeta);

  let report = h.pipeline.recovery.run().await.unwrap();
  assert_eq!(report.purged, 1);
  assert_eq!(report.imports[0].action, RecoveryAction::Restart);
  assert_eq!(h.status(import_id).await.status, ImportStatus::Queued);

  h.pipeline.run_until_idle().await.unwrap();
  assert_eq!(h.status(import_id).await.status, ImportStatus::Complete);
  assert_eq!(h.query_all(import_id).await.0, 3);
}

#[tokio::test]
async fn recovery_republishes_a_lost_finalize_message() {
  let h = harness().await;
  let import_id = h.submit(&SeedSet::synthetic(20)).await;
  h.split().await;
  h.deliver(import_id, 1).await;
  h.deliver(import_id, 2).await;
  // The finalize message is lost with the queue.
  h.pipeline.queue().purge(QueueName::ImportsPending).await.unwrap();

  let report = h.pipeline.recovery.run().await.unwrap();
  assert_eq!(report.imports[0].action, RecoveryAction::Republish(ImportStatus::Finalize));

  h.pipeline.run_until_idle().await.unwrap();
  assert_eq!(h.status(import_id).await.status, ImportStatus::Complete);
}

#[tokio::test]
async fn recovery_request_on_the_queue_runs_a_pass() {
  let h = harness().await;
  let import_id = h.submit(&SeedSet::absence()).await;
  let queue = h.pipeline.queue();
  queue.purge(QueueName::ImportsPending).await.unwrap();
  queue
    .send(QueueName::RestartImports, serde_json::json!({ "requestedBy": "test" }))
    .await
    .unwrap();

  h.pipeline.run_until_idle().await.unwrap();
  assert_eq!(h.status(import_id).await.status, ImportStatus::Complete);
}
