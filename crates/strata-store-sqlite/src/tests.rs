//! Integration tests for `SqliteStore` against in-memory and on-disk databases.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;
use strata_core::{
  dimension::{GeographicLevel, NewFilter, NewIndicator, NewLocation},
  footnote::{FootnoteScope, FootnoteTarget, NewFootnote},
  import::{FinalizeOutcome, ImportErrorEntry, ImportStatus, ImportUpdate, NewImport},
  message::ImportMessage,
  observation::{BatchOutcome, NewObservation, ObservationBatch},
  query::{DataSetQuery, FacetNode, ObservationQuery, SortDirection, SortField, SortSpec},
  store::StatStore,
  time::{TimeIdentifier, TimePeriod},
};
use uuid::Uuid;

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn england() -> NewLocation {
  NewLocation {
    level: GeographicLevel::Country,
    code:  "E92000001".into(),
    name:  "England".into(),
  }
}

fn new_import(subject_id: Uuid) -> NewImport {
  let import_id = Uuid::new_v4();
  NewImport {
    import_id,
    subject_id,
    release_id: Uuid::new_v4(),
    data_file_name: "absence.csv".into(),
    meta_file_name: "absence.meta.csv".into(),
    message: ImportMessage {
      import_id,
      subject_id,
      data_file_name: "absence.csv".into(),
      meta_file_name: "absence.meta.csv".into(),
      release: Uuid::new_v4(),
      stage: ImportStatus::Queued,
      batch_no: 0,
      num_batches: 0,
      rows_per_batch: 0,
      total_rows: 0,
    },
  }
}

/// Walk an import forward to `IMPORT_OBSERVATIONS` expecting `num_batches`.
async fn to_observations(s: &SqliteStore, import_id: Uuid, num_batches: u32) {
  for (from, to) in [
    (ImportStatus::Queued, ImportStatus::ProcessingArchive),
    (ImportStatus::ProcessingArchive, ImportStatus::ValidateAndImportMeta),
  ] {
    assert!(s.transition_import(import_id, from, to).await.unwrap());
  }
  s.update_import(import_id, ImportUpdate {
    rows_per_batch: 10,
    total_rows: u64::from(num_batches) * 10,
    num_batches,
    geographic_levels: BTreeSet::from([GeographicLevel::Country]),
    data_columns: vec!["time_period".into()],
    checksum: Some("abc".into()),
  })
  .await
  .unwrap();
  for (from, to) in [
    (ImportStatus::ValidateAndImportMeta, ImportStatus::Split),
    (ImportStatus::Split, ImportStatus::ImportObservations),
  ] {
    assert!(s.transition_import(import_id, from, to).await.unwrap());
  }
}

/// A subject with one filter (two items), one indicator and one location.
struct Fixture {
  subject_id: Uuid,
  location:   Uuid,
  items:      [Uuid; 2],
  indicator:  Uuid,
}

async fn fixture(s: &SqliteStore) -> Fixture {
  let subject = s.create_subject(Uuid::new_v4(), "Absence".into()).await.unwrap();
  let location = s.get_or_create_location(england()).await.unwrap();
  let filter = s
    .get_or_create_filter(NewFilter {
      subject_id:      subject.subject_id,
      name:            "school_type".into(),
      label:           "School type".into(),
      hint:            None,
      grouping_column: None,
    })
    .await
    .unwrap();
  let group = s
    .get_or_create_filter_group(filter.filter_id, "Default".into())
    .await
    .unwrap();
  let primary = s
    .get_or_create_filter_item(group.filter_group_id, "Primary".into())
    .await
    .unwrap();
  let secondary = s
    .get_or_create_filter_item(group.filter_group_id, "Secondary".into())
    .await
    .unwrap();
  let indicator = s
    .get_or_create_indicator(NewIndicator {
      subject_id:     subject.subject_id,
      group_label:    "Absence".into(),
      name:           "sess_authorised".into(),
      label:          "Authorised sessions".into(),
      unit:           None,
      decimal_places: Some(0),
    })
    .await
    .unwrap();

  Fixture {
    subject_id: subject.subject_id,
    location:   location.location_id,
    items:      [primary.filter_item_id, secondary.filter_item_id],
    indicator:  indicator.indicator_id,
  }
}

fn observation(f: &Fixture, csv_row: u64, year: i32, item: Uuid, value: &str) -> NewObservation {
  NewObservation {
    subject_id:       f.subject_id,
    location_id:      f.location,
    geographic_level: GeographicLevel::Country,
    time_period:      TimePeriod::new(year, TimeIdentifier::AcademicYear),
    csv_row,
    filter_item_ids:  vec![item],
    measures:         BTreeMap::from([(f.indicator, value.to_owned())]),
  }
}

fn batch(import_id: Uuid, f: &Fixture, batch_no: u32, rows: u64) -> ObservationBatch {
  ObservationBatch {
    import_id,
    batch_no,
    subject_id: f.subject_id,
    observations: (0..rows)
      .map(|i| {
        let row = u64::from(batch_no - 1) * rows + i + 1;
        observation(f, row, 2015 + (row % 5) as i32, f.items[(row % 2) as usize], &row.to_string())
      })
      .collect(),
  }
}

/// A subject holding 100 observations across five years and both items.
async fn loaded(s: &SqliteStore) -> Fixture {
  let f = fixture(s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  to_observations(s, import.import_id, 4).await;
  for n in 1..=4 {
    let outcome = s.import_batch(batch(import.import_id, &f, n, 25)).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Imported { rows: 25 });
  }
  f
}

fn query(f: &Fixture, facets: serde_json::Value, page: u32, page_size: u32) -> ObservationQuery {
  ObservationQuery {
    subject_id: f.subject_id,
    facets: serde_json::from_value(facets).unwrap(),
    indicators: vec![f.indicator],
    sort: Vec::new(),
    page,
    page_size,
  }
}

async fn ids(s: &SqliteStore, q: &ObservationQuery) -> BTreeSet<Uuid> {
  s.query_observations(q)
    .await
    .unwrap()
    .rows
    .into_iter()
    .map(|r| r.observation_id)
    .collect()
}

// ─── Subjects ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_get_subject() {
  let s = store().await;
  let release = Uuid::new_v4();
  let subject = s.create_subject(release, "Pupil absence".into()).await.unwrap();

  let fetched = s.get_subject(subject.subject_id).await.unwrap().unwrap();
  assert_eq!(fetched.release_id, release);
  assert_eq!(fetched.name, "Pupil absence");
  assert!(s.get_subject(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn release_subjects_are_scoped_to_the_release() {
  let s = store().await;
  let release = Uuid::new_v4();
  let first = s.create_subject(release, "Absence".into()).await.unwrap();
  let second = s.create_subject(release, "Exclusions".into()).await.unwrap();
  s.create_subject(Uuid::new_v4(), "Elsewhere".into()).await.unwrap();

  let ids: Vec<Uuid> = s.release_subjects(release).await.unwrap().iter().map(|s| s.subject_id).collect();
  assert_eq!(ids, vec![first.subject_id, second.subject_id]);
}

#[tokio::test]
async fn subject_meta_missing_returns_none() {
  let s = store().await;
  assert!(s.subject_meta(Uuid::new_v4()).await.unwrap().is_none());
}

// ─── Dimensions ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_or_create_is_idempotent() {
  let s = store().await;
  let f = fixture(&s).await;
  let again = fixture_ids_again(&s, f.subject_id).await;
  assert_eq!(again.0, f.location);
  assert_eq!(again.1, f.indicator);
  assert_eq!(s.list_locations().await.unwrap().len(), 1);
}

async fn fixture_ids_again(s: &SqliteStore, subject_id: Uuid) -> (Uuid, Uuid) {
  let location = s.get_or_create_location(england()).await.unwrap();
  let indicator = s
    .get_or_create_indicator(NewIndicator {
      subject_id,
      group_label: "Absence".into(),
      name: "sess_authorised".into(),
      label: "Something else".into(),
      unit: Some("%".into()),
      decimal_places: None,
    })
    .await
    .unwrap();
  // The first write wins; later attributes are ignored.
  assert_eq!(indicator.label, "Authorised sessions");
  (location.location_id, indicator.indicator_id)
}

#[tokio::test]
async fn concurrent_creators_converge_on_one_row() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("strata.db");
  let mut stores = Vec::new();
  for _ in 0..8 {
    stores.push(SqliteStore::open(&path).await.unwrap());
  }

  let mut creators = tokio::task::JoinSet::new();
  for store in stores {
    creators.spawn(async move { store.get_or_create_location(england()).await.unwrap().location_id });
  }
  let mut ids = BTreeSet::new();
  while let Some(id) = creators.join_next().await {
    ids.insert(id.unwrap());
  }
  assert_eq!(ids.len(), 1);

  let check = SqliteStore::open(&path).await.unwrap();
  assert_eq!(check.list_locations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn reopening_keeps_data_and_schema_version() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("strata.db");
  let subject = {
    let s = SqliteStore::open(&path).await.unwrap();
    s.create_subject(Uuid::new_v4(), "Absence".into()).await.unwrap()
  };

  let s = SqliteStore::open(&path).await.unwrap();
  assert_eq!(s.schema_version().await.unwrap(), crate::schema::SCHEMA_VERSION);
  let fetched = s.get_subject(subject.subject_id).await.unwrap().unwrap();
  assert_eq!(fetched.name, "Absence");
}

#[tokio::test]
async fn subject_meta_nests_groups_and_items() {
  let s = store().await;
  let f = loaded(&s).await;
  let meta = s.subject_meta(f.subject_id).await.unwrap().unwrap();

  assert_eq!(meta.filters.len(), 1);
  let items: Vec<_> = meta.filters[0].items().map(|i| i.filter_item_id).collect();
  assert_eq!(items, f.items.to_vec());
  assert_eq!(meta.indicators.len(), 1);
  assert_eq!(meta.indicator_groups[0].label, "Absence");
  assert_eq!(meta.locations.len(), 1);
  assert_eq!(meta.geographic_levels, vec![GeographicLevel::Country]);
  let years: Vec<i32> = meta.time_periods.iter().map(|p| p.year).collect();
  assert_eq!(years, vec![2015, 2016, 2017, 2018, 2019]);
}

// ─── Imports ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transition_is_compare_and_set() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  assert_eq!(import.status, ImportStatus::Queued);

  let id = import.import_id;
  assert!(s.transition_import(id, ImportStatus::Queued, ImportStatus::ProcessingArchive).await.unwrap());
  // A second worker holding the stale status loses.
  assert!(!s.transition_import(id, ImportStatus::Queued, ImportStatus::ProcessingArchive).await.unwrap());
  // Skipping a phase is illegal.
  assert!(s.transition_import(id, ImportStatus::ProcessingArchive, ImportStatus::Split).await.is_err());

  let record = s.get_import(id).await.unwrap().unwrap();
  assert_eq!(record.status, ImportStatus::ProcessingArchive);
  assert!(record.last_message.is_some());
}

#[tokio::test]
async fn update_keeps_first_batch_count() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  to_observations(&s, import.import_id, 3).await;

  s.update_import(import.import_id, ImportUpdate { num_batches: 7, ..ImportUpdate::default() })
    .await
    .unwrap();
  let record = s.get_import(import.import_id).await.unwrap().unwrap();
  assert_eq!(record.num_batches, 3);
  assert_eq!(record.checksum.as_deref(), Some("abc"));
}

#[tokio::test]
async fn list_imports_by_status() {
  let s = store().await;
  let f = fixture(&s).await;
  let a = s.create_import(new_import(f.subject_id)).await.unwrap();
  let b = s.create_import(new_import(f.subject_id)).await.unwrap();
  to_observations(&s, b.import_id, 2).await;

  let queued = s.list_imports(&[ImportStatus::Queued]).await.unwrap();
  assert_eq!(queued.len(), 1);
  assert_eq!(queued[0].import_id, a.import_id);
  let in_flight = s.list_imports(&ImportStatus::IN_FLIGHT).await.unwrap();
  assert_eq!(in_flight.len(), 1);
  assert_eq!(in_flight[0].import_id, b.import_id);
}

#[tokio::test]
async fn fail_and_cancel_are_absorbing() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  let id = import.import_id;

  assert!(s.fail_import(id, vec![ImportErrorEntry::new("bad header")]).await.unwrap());
  assert!(!s.cancel_import(id).await.unwrap());
  assert!(!s.restart_import(id).await.unwrap());

  let record = s.get_import(id).await.unwrap().unwrap();
  assert_eq!(record.status, ImportStatus::Failed);
  assert_eq!(record.errors.len(), 1);
  assert_eq!(record.errors[0].message, "bad header");
}

#[tokio::test]
async fn record_errors_appends_without_status_change() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  s.record_import_errors(import.import_id, vec![ImportErrorEntry::new("one")]).await.unwrap();
  s.record_import_errors(import.import_id, vec![ImportErrorEntry::new("two")]).await.unwrap();

  let record = s.get_import(import.import_id).await.unwrap().unwrap();
  assert_eq!(record.status, ImportStatus::Queued);
  let messages: Vec<_> = record.errors.iter().map(|e| e.message.as_str()).collect();
  assert_eq!(messages, vec!["one", "two"]);
}

#[tokio::test]
async fn restart_clears_partial_work() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  to_observations(&s, import.import_id, 2).await;
  s.import_batch(batch(import.import_id, &f, 1, 10)).await.unwrap();

  assert!(s.restart_import(import.import_id).await.unwrap());
  let record = s.get_import(import.import_id).await.unwrap().unwrap();
  assert_eq!(record.status, ImportStatus::Queued);
  assert_eq!(record.imported_rows, 0);
  assert_eq!(record.num_batches, 0);
  assert!(s.imported_batches(import.import_id).await.unwrap().is_empty());
  let page = s.query_observations(&query(&f, json!({}), 1, 100)).await.unwrap();
  assert_eq!(page.total_results, 0);
}

// ─── Observations ────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_is_written_once() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  to_observations(&s, import.import_id, 2).await;

  let first = s.import_batch(batch(import.import_id, &f, 2, 10)).await.unwrap();
  assert_eq!(first, BatchOutcome::Imported { rows: 10 });
  let again = s.import_batch(batch(import.import_id, &f, 2, 10)).await.unwrap();
  assert_eq!(again, BatchOutcome::AlreadyImported);

  let record = s.get_import(import.import_id).await.unwrap().unwrap();
  assert_eq!(record.imported_rows, 10);
  assert_eq!(record.completed_batches, 1);
  assert_eq!(s.imported_batches(import.import_id).await.unwrap(), vec![2]);
}

#[tokio::test]
async fn batch_after_cancel_is_rejected() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  to_observations(&s, import.import_id, 1).await;
  assert!(s.cancel_import(import.import_id).await.unwrap());

  let outcome = s.import_batch(batch(import.import_id, &f, 1, 5)).await.unwrap();
  assert_eq!(outcome, BatchOutcome::Rejected { status: ImportStatus::Cancelled });
  let page = s.query_observations(&query(&f, json!({}), 1, 100)).await.unwrap();
  assert_eq!(page.total_results, 0);
}

#[tokio::test]
async fn finalize_requires_every_batch() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  let id = import.import_id;
  to_observations(&s, id, 2).await;

  assert_eq!(
    s.finalize_import(id).await.unwrap(),
    FinalizeOutcome::NotInFinalize(ImportStatus::ImportObservations)
  );

  s.import_batch(batch(id, &f, 1, 10)).await.unwrap();
  assert!(s.transition_import(id, ImportStatus::ImportObservations, ImportStatus::Finalize).await.unwrap());
  assert_eq!(
    s.finalize_import(id).await.unwrap(),
    FinalizeOutcome::Incomplete { completed: 1, expected: 2 }
  );
}

#[tokio::test]
async fn finalize_completes_and_summarises() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  let id = import.import_id;
  to_observations(&s, id, 2).await;
  s.import_batch(batch(id, &f, 1, 10)).await.unwrap();
  s.import_batch(batch(id, &f, 2, 10)).await.unwrap();
  assert!(s.transition_import(id, ImportStatus::ImportObservations, ImportStatus::Finalize).await.unwrap());

  let FinalizeOutcome::Completed(summary) = s.finalize_import(id).await.unwrap() else {
    panic!("expected completion");
  };
  assert_eq!(summary.observation_count, 20);
  assert_eq!(summary.geographic_levels, vec![GeographicLevel::Country]);
  assert_eq!(summary.first_period.map(|p| p.year), Some(2015));
  assert_eq!(summary.last_period.map(|p| p.year), Some(2019));

  let record = s.get_import(id).await.unwrap().unwrap();
  assert_eq!(record.status, ImportStatus::Complete);
  assert_eq!(record.percent_complete(), 100.0);
  // A second finalize is a no-op.
  assert_eq!(
    s.finalize_import(id).await.unwrap(),
    FinalizeOutcome::NotInFinalize(ImportStatus::Complete)
  );
  assert_eq!(s.subject_summary(f.subject_id).await.unwrap(), Some(summary));
}

#[tokio::test]
async fn finalize_rejects_rows_that_do_not_add_up() {
  let s = store().await;
  let f = fixture(&s).await;
  let import = s.create_import(new_import(f.subject_id)).await.unwrap();
  let id = import.import_id;
  to_observations(&s, id, 2).await;
  s.import_batch(batch(id, &f, 1, 10)).await.unwrap();
  s.import_batch(batch(id, &f, 2, 4)).await.unwrap();
  assert!(s.transition_import(id, ImportStatus::ImportObservations, ImportStatus::Finalize).await.unwrap());

  assert_eq!(
    s.finalize_import(id).await.unwrap(),
    FinalizeOutcome::RowCountMismatch { imported: 14, expected: 20 }
  );
  assert_eq!(s.get_import(id).await.unwrap().unwrap().status, ImportStatus::Finalize);
}

#[tokio::test]
async fn racing_finalizers_complete_once() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("strata.db");
  let a = SqliteStore::open(&path).await.unwrap();
  let b = SqliteStore::open(&path).await.unwrap();

  let f = fixture(&a).await;
  let import = a.create_import(new_import(f.subject_id)).await.unwrap();
  let id = import.import_id;
  to_observations(&a, id, 2).await;
  a.import_batch(batch(id, &f, 1, 10)).await.unwrap();
  a.import_batch(batch(id, &f, 2, 10)).await.unwrap();
  assert!(a.transition_import(id, ImportStatus::ImportObservations, ImportStatus::Finalize).await.unwrap());

  let (x, y) = tokio::join!(a.finalize_import(id), b.finalize_import(id));
  let outcomes = [x.unwrap(), y.unwrap()];
  let completed = outcomes
    .iter()
    .filter(|o| matches!(o, FinalizeOutcome::Completed(_)))
    .count();
  assert_eq!(completed, 1, "{outcomes:?}");
  assert!(outcomes.iter().all(|o| matches!(
    o,
    FinalizeOutcome::Completed(_)
      | FinalizeOutcome::Locked
      | FinalizeOutcome::NotInFinalize(ImportStatus::Complete)
  )));
  assert_eq!(b.get_import(id).await.unwrap().unwrap().status, ImportStatus::Complete);
}

#[tokio::test]
async fn held_finalize_lock_is_visible_to_other_connections() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("strata.db");
  let a = SqliteStore::open(&path).await.unwrap();
  let b = SqliteStore::open(&path).await.unwrap();

  let f = fixture(&a).await;
  let import = a.create_import(new_import(f.subject_id)).await.unwrap();
  let id = import.import_id;
  to_observations(&a, id, 1).await;
  a.import_batch(batch(id, &f, 1, 10)).await.unwrap();
  assert!(a.transition_import(id, ImportStatus::ImportObservations, ImportStatus::Finalize).await.unwrap());

  let lock = format!("finalize:{id}");
  let token = a.try_lock(&lock).await.unwrap().expect("lock is free");
  assert_eq!(b.finalize_import(id).await.unwrap(), FinalizeOutcome::Locked);
  assert!(b.try_lock(&lock).await.unwrap().is_none());

  a.unlock(&lock, token).await.unwrap();
  assert!(matches!(b.finalize_import(id).await.unwrap(), FinalizeOutcome::Completed(_)));
}

// ─── Queries ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn and_narrows_or_widens() {
  let s = store().await;
  let f = loaded(&s).await;
  let primary = json!({ "filters": { "eq": f.items[0] } });
  let recent = json!({ "timePeriods": { "gte": { "year": 2018, "code": "AY" } } });

  let all = ids(&s, &query(&f, json!({}), 1, 1000)).await;
  let p = ids(&s, &query(&f, primary.clone(), 1, 1000)).await;
  let r = ids(&s, &query(&f, recent.clone(), 1, 1000)).await;
  let and = ids(&s, &query(&f, json!({ "and": [primary.clone(), recent.clone()] }), 1, 1000)).await;
  let or = ids(&s, &query(&f, json!({ "or": [primary.clone(), recent.clone()] }), 1, 1000)).await;
  let not = ids(&s, &query(&f, json!({ "not": primary }), 1, 1000)).await;

  assert_eq!(all.len(), 100);
  assert_eq!(p.len(), 50);
  assert_eq!(r.len(), 40);
  assert!(and.is_subset(&p) && and.is_subset(&r));
  assert!(or.is_superset(&p) && or.is_superset(&r));
  assert_eq!(and, p.intersection(&r).copied().collect());
  assert_eq!(or, p.union(&r).copied().collect());
  assert!(not.is_disjoint(&p));
  assert_eq!(not.len() + p.len(), all.len());
}

#[tokio::test]
async fn in_with_no_values_matches_nothing() {
  let s = store().await;
  let f = loaded(&s).await;
  let page = s
    .query_observations(&query(&f, json!({ "locations": { "in": [] } }), 1, 10))
    .await
    .unwrap();
  assert_eq!(page.total_results, 0);
  assert!(page.rows.is_empty());
}

#[tokio::test]
async fn paging_covers_every_row_once() {
  let s = store().await;
  let f = loaded(&s).await;

  let mut seen = BTreeSet::new();
  for page in 1..=4 {
    let result = s.query_observations(&query(&f, json!({}), page, 30)).await.unwrap();
    assert_eq!(result.total_results, 100);
    assert_eq!(result.rows.len(), if page < 4 { 30 } else { 10 });
    seen.extend(result.rows.into_iter().map(|r| r.observation_id));
  }
  assert_eq!(seen.len(), 100);
}

#[tokio::test]
async fn default_sort_is_newest_first() {
  let s = store().await;
  let f = loaded(&s).await;
  let rows = s.query_observations(&query(&f, json!({}), 1, 100)).await.unwrap().rows;
  let keys: Vec<_> = rows.iter().map(|r| r.time_period.sort_key()).collect();
  assert!(keys.windows(2).all(|w| w[0] >= w[1]));
  assert_eq!(rows[0].time_period.year, 2019);
}

#[tokio::test]
async fn sort_by_indicator_is_numeric() {
  let s = store().await;
  let f = loaded(&s).await;
  let mut q = query(&f, json!({}), 1, 100);
  q.sort = vec![SortSpec { field: SortField::Indicator(f.indicator), direction: SortDirection::Asc }];

  let values: Vec<u64> = s
    .query_observations(&q)
    .await
    .unwrap()
    .rows
    .iter()
    .map(|r| r.values[&f.indicator].parse().unwrap())
    .collect();
  assert_eq!(values, (1..=100).collect::<Vec<_>>());
}

#[tokio::test]
async fn rows_carry_only_requested_indicators() {
  let s = store().await;
  let f = loaded(&s).await;
  let mut q = query(&f, json!({}), 1, 5);
  q.indicators = Vec::new();
  let rows = s.query_observations(&q).await.unwrap().rows;
  assert!(rows.iter().all(|r| r.values.is_empty()));
  assert!(rows.iter().all(|r| r.filters.len() == 1));
}

#[tokio::test]
async fn compiled_data_set_query_runs() {
  let s = store().await;
  let f = loaded(&s).await;
  let meta = s.subject_meta(f.subject_id).await.unwrap().unwrap();
  let body: DataSetQuery = serde_json::from_value(json!({
    "facets": { "geographicLevels": { "eq": "Country" } }
  }))
  .unwrap();
  let q = body.compile(&meta, 1, 10, 100).unwrap();
  assert_eq!(q.indicators, vec![f.indicator]);
  let page = s.query_observations(&q).await.unwrap();
  assert_eq!(page.total_results, 100);
  assert_eq!(page.rows.len(), 10);
  assert_eq!(q.facets, serde_json::from_value::<FacetNode>(json!({ "geographicLevels": { "eq": "Country" } })).unwrap());
}

#[tokio::test]
async fn stream_walks_keyset_chunks() {
  let s = store().await;
  let f = loaded(&s).await;
  let q = query(&f, json!({ "filters": { "eq": f.items[1] } }), 1, 1);

  let mut cursor = None;
  let mut sizes = Vec::new();
  let mut seen = BTreeSet::new();
  loop {
    let chunk = s.stream_observations(&q, cursor, 20).await.unwrap();
    sizes.push(chunk.rows.len());
    seen.extend(chunk.rows.iter().map(|r| r.observation_id));
    match chunk.next_cursor {
      Some(next) => cursor = Some(next),
      None => break,
    }
  }
  // 50 matching rows: two full chunks, then a short one.
  assert_eq!(sizes, vec![20, 20, 10]);
  assert_eq!(seen.len(), 50);
}

// ─── Footnotes ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn footnotes_match_any_scope() {
  let s = store().await;
  let f = fixture(&s).await;

  let on_subject = s
    .add_footnote(NewFootnote {
      content: "Applies to the whole subject".into(),
      scopes:  vec![FootnoteScope::Subject(f.subject_id)],
    })
    .await
    .unwrap();
  let on_item = s
    .add_footnote(NewFootnote {
      content: "Primary schools only".into(),
      scopes:  vec![FootnoteScope::FilterItem(f.items[0])],
    })
    .await
    .unwrap();
  s.add_footnote(NewFootnote {
    content: "Elsewhere".into(),
    scopes:  vec![FootnoteScope::Subject(Uuid::new_v4())],
  })
  .await
  .unwrap();

  let subject_only = FootnoteTarget { subject_id: f.subject_id, ..FootnoteTarget::default() };
  let notes = s.footnotes_for(&subject_only).await.unwrap();
  assert_eq!(notes.iter().map(|n| n.footnote_id).collect::<Vec<_>>(), vec![on_subject.footnote_id]);

  let with_item = FootnoteTarget {
    subject_id: f.subject_id,
    filter_items: vec![f.items[0]],
    ..FootnoteTarget::default()
  };
  let notes = s.footnotes_for(&with_item).await.unwrap();
  assert_eq!(notes.len(), 2);
  assert!(notes.iter().any(|n| n.footnote_id == on_item.footnote_id));
  assert_eq!(notes[1].scopes, vec![FootnoteScope::FilterItem(f.items[0])]);
}
