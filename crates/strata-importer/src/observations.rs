//! Turning one batch of data rows into observations.

use std::{collections::HashMap, sync::Arc};

use strata_core::{
  dimension::SubjectMeta,
  import::ImportRecord,
  observation::{BatchOutcome, NewObservation, ObservationBatch},
  store::StatStore,
};
use strata_csv::{DataHeader, MetaSchema, ParsedRow, RowError, RowParser, first_row_of};
use tracing::debug;
use uuid::Uuid;

use crate::{Dimensions, Error, Result};

pub struct ObservationImporter<S> {
  store:      Arc<S>,
  dimensions: Arc<Dimensions>,
}

impl<S: StatStore> ObservationImporter<S> {
  pub fn new(store: Arc<S>, dimensions: Arc<Dimensions>) -> Self { Self { store, dimensions } }

  /// Parse, resolve and write one batch. Any row error rejects the whole
  /// batch before anything is written; the store then commits the rows and
  /// the batch record together, or not at all.
  pub async fn import_batch(
    &self,
    record: &ImportRecord,
    meta: &SubjectMeta,
    batch_no: u32,
    data: &[u8],
  ) -> Result<BatchOutcome> {
    let schema = MetaSchema::from(meta);
    let header = DataHeader::new(record.data_columns.clone());
    let parser = RowParser::new(header, &schema).map_err(Error::Validation)?;

    let first_row = first_row_of(batch_no, record.rows_per_batch);
    let (rows, errors) = parser.parse_all(data, batch_no == 1, first_row)?;
    if !errors.is_empty() {
      return Err(Error::Validation(errors));
    }

    self.dimensions.warm_subject(meta);
    let resolver = Resolver::new(meta);
    let mut observations = Vec::with_capacity(rows.len());
    for row in rows {
      observations.push(self.resolve(&resolver, meta.subject.subject_id, row).await?);
    }

    debug!(
      import_id = %record.import_id,
      batch_no,
      rows = observations.len(),
      "writing batch"
    );
    self
      .store
      .import_batch(ObservationBatch {
        import_id: record.import_id,
        batch_no,
        subject_id: record.subject_id,
        observations,
      })
      .await
      .map_err(Error::store)
  }

  async fn resolve(&self, resolver: &Resolver<'_>, subject_id: Uuid, row: ParsedRow) -> Result<NewObservation> {
    let store = self.store.as_ref();
    let location_id = self.dimensions.location(store, row.location).await?;

    let mut filter_item_ids = Vec::with_capacity(row.filters.len());
    for value in &row.filters {
      let filter_id = resolver.filter(row.row_no, &value.filter)?;
      let group_id = self.dimensions.filter_group(store, filter_id, &value.group).await?;
      filter_item_ids.push(self.dimensions.filter_item(store, group_id, &value.item).await?);
    }

    let measures = row
      .values
      .into_iter()
      .map(|(name, value)| Ok((resolver.indicator(row.row_no, &name)?, value)))
      .collect::<Result<_>>()?;

    Ok(NewObservation {
      subject_id,
      location_id,
      geographic_level: row.geographic_level,
      time_period: row.time_period,
      csv_row: row.row_no,
      filter_item_ids,
      measures,
    })
  }
}

/// Name → id lookups for the subject-scoped columns of one batch.
struct Resolver<'a> {
  filters:    HashMap<&'a str, Uuid>,
  indicators: HashMap<&'a str, Uuid>,
}

impl<'a> Resolver<'a> {
  fn new(meta: &'a SubjectMeta) -> Self {
    Self {
      filters:    meta
        .filters
        .iter()
        .map(|f| (f.filter.name.as_str(), f.filter.filter_id))
        .collect(),
      indicators: meta
        .indicators
        .iter()
        .map(|i| (i.name.as_str(), i.indicator_id))
        .collect(),
    }
  }

  fn filter(&self, row: u64, name: &str) -> Result<Uuid> {
    self.filters.get(name).copied().ok_or_else(|| unknown(row, name, "filter"))
  }

  fn indicator(&self, row: u64, name: &str) -> Result<Uuid> {
    self.indicators.get(name).copied().ok_or_else(|| unknown(row, name, "indicator"))
  }
}

fn unknown(row: u64, column: &str, kind: &str) -> Error {
  Error::Validation(vec![RowError::at(row, Some(column), format!("{kind} not defined for subject"))])
}
