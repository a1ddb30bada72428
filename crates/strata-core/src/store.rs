//! The `StatStore` trait: the relational store shared by the importer (which
//! writes it) and the query engine (which reads it).
//!
//! Implemented by storage backends (e.g. `strata-store-sqlite`). Higher layers
//! depend on this abstraction, not on any concrete backend.

use std::future::Future;

use uuid::Uuid;

use crate::{
  dimension::{
    Filter, FilterGroup, FilterItem, Indicator, Location, NewFilter, NewIndicator, NewLocation,
    Subject, SubjectMeta,
  },
  footnote::{Footnote, FootnoteTarget, NewFootnote},
  import::{FinalizeOutcome, ImportErrorEntry, ImportRecord, ImportStatus, ImportUpdate, NewImport},
  observation::{BatchOutcome, ObservationBatch, ObservationRow},
  query::ObservationQuery,
};

/// One page of query results.
#[derive(Debug, Clone)]
pub struct ObservationPage {
  pub rows:          Vec<ObservationRow>,
  pub total_results: u64,
}

/// One chunk of a keyset-paginated scan. Pass `next_cursor` back to continue;
/// `None` means the scan is exhausted.
#[derive(Debug, Clone)]
pub struct ObservationChunk {
  pub rows:        Vec<ObservationRow>,
  pub next_cursor: Option<i64>,
}

/// Abstraction over a strata store backend.
///
/// Dimension and observation rows are immutable once written. Dimension
/// creation is get-or-insert on the natural key and converges on a single row
/// even when independent processes race.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
pub trait StatStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Subjects ──────────────────────────────────────────────────────────

  fn create_subject(
    &self,
    release_id: Uuid,
    name: String,
  ) -> impl Future<Output = Result<Subject, Self::Error>> + Send + '_;

  fn get_subject(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Subject>, Self::Error>> + Send + '_;

  /// Filters, indicators, and the locations / periods / levels present in
  /// the subject's observations. `None` if the subject does not exist.
  fn subject_meta(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<SubjectMeta>, Self::Error>> + Send + '_;

  // ── Dimensions: get-or-insert on natural key ─────────────────────────

  /// Every location row; used to pre-warm the importer's cache.
  fn list_locations(&self) -> impl Future<Output = Result<Vec<Location>, Self::Error>> + Send + '_;

  fn get_or_create_location(
    &self,
    input: NewLocation,
  ) -> impl Future<Output = Result<Location, Self::Error>> + Send + '_;

  fn get_or_create_filter(
    &self,
    input: NewFilter,
  ) -> impl Future<Output = Result<Filter, Self::Error>> + Send + '_;

  fn get_or_create_filter_group(
    &self,
    filter_id: Uuid,
    label: String,
  ) -> impl Future<Output = Result<FilterGroup, Self::Error>> + Send + '_;

  fn get_or_create_filter_item(
    &self,
    filter_group_id: Uuid,
    label: String,
  ) -> impl Future<Output = Result<FilterItem, Self::Error>> + Send + '_;

  /// Creates the indicator's group on demand.
  fn get_or_create_indicator(
    &self,
    input: NewIndicator,
  ) -> impl Future<Output = Result<Indicator, Self::Error>> + Send + '_;

  // ── Imports ───────────────────────────────────────────────────────────

  fn create_import(
    &self,
    input: NewImport,
  ) -> impl Future<Output = Result<ImportRecord, Self::Error>> + Send + '_;

  fn get_import(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<ImportRecord>, Self::Error>> + Send + '_;

  /// Imports currently in any of `statuses`, oldest first.
  fn list_imports<'a>(
    &'a self,
    statuses: &'a [ImportStatus],
  ) -> impl Future<Output = Result<Vec<ImportRecord>, Self::Error>> + Send + 'a;

  /// Compare-and-set the status. Returns `false` (and changes nothing) if the
  /// persisted status is not `from`. Illegal transitions are errors.
  fn transition_import(
    &self,
    id: Uuid,
    from: ImportStatus,
    to: ImportStatus,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Explicit restart: reset a non-terminal import to `QUEUED` and clear its
  /// counts, batch records and errors. Returns `false` if it was terminal.
  fn restart_import(&self, id: Uuid) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Record the counts resolved by the meta phase.
  fn update_import(
    &self,
    id: Uuid,
    update: ImportUpdate,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Move a non-terminal import to `FAILED` with `errors`. Returns `false` if
  /// it was already terminal.
  fn fail_import(
    &self,
    id: Uuid,
    errors: Vec<ImportErrorEntry>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Move a non-terminal import to `CANCELLED`. Returns `false` if it was
  /// already terminal.
  fn cancel_import(&self, id: Uuid) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Append errors without changing status.
  fn record_import_errors(
    &self,
    id: Uuid,
    errors: Vec<ImportErrorEntry>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Observations ──────────────────────────────────────────────────────

  /// Write a batch all-or-nothing: the observations, their filter-item
  /// junction rows, the batch record and the imported-row count commit
  /// together. Checks, inside the same transaction, that the import is still
  /// in `IMPORT_OBSERVATIONS` and that the batch is not already recorded.
  fn import_batch(
    &self,
    batch: ObservationBatch,
  ) -> impl Future<Output = Result<BatchOutcome, Self::Error>> + Send + '_;

  /// Batch numbers recorded as imported, ascending.
  fn imported_batches(
    &self,
    import_id: Uuid,
  ) -> impl Future<Output = Result<Vec<u32>, Self::Error>> + Send + '_;

  /// Under the named lock `finalize:{import_id}`: verify every batch is
  /// recorded and the imported rows match `total_rows`, recompute the
  /// subject's aggregates and promote `FINALIZE → COMPLETE`. The lock is
  /// visible to every other store on the same database while held.
  fn finalize_import(
    &self,
    import_id: Uuid,
  ) -> impl Future<Output = Result<FinalizeOutcome, Self::Error>> + Send + '_;

  // ── Queries ───────────────────────────────────────────────────────────

  fn query_observations<'a>(
    &'a self,
    query: &'a ObservationQuery,
  ) -> impl Future<Output = Result<ObservationPage, Self::Error>> + Send + 'a;

  /// Keyset scan for exports: rows after `cursor` in storage order, at most
  /// `limit` of them. Ignores the query's sort and paging.
  fn stream_observations<'a>(
    &'a self,
    query: &'a ObservationQuery,
    cursor: Option<i64>,
    limit: u32,
  ) -> impl Future<Output = Result<ObservationChunk, Self::Error>> + Send + 'a;

  // ── Footnotes ─────────────────────────────────────────────────────────

  fn add_footnote(
    &self,
    input: NewFootnote,
  ) -> impl Future<Output = Result<Footnote, Self::Error>> + Send + '_;

  /// Footnotes with at least one scope intersecting `target`.
  fn footnotes_for<'a>(
    &'a self,
    target: &'a FootnoteTarget,
  ) -> impl Future<Output = Result<Vec<Footnote>, Self::Error>> + Send + 'a;
}
