//! CSV export of query results.
//!
//! Output columns mirror the source data-file layout:
//!
//! ```text
//! time_period,time_identifier,geographic_level,location_code,location_name,<filters…>,<indicators…>
//! ```
//!
//! Encoding is chunked so callers can stream a large result set without
//! holding it in memory.

use std::collections::HashMap;

use strata_core::{dimension::SubjectMeta, observation::ObservationRow};
use uuid::Uuid;

use crate::Result;

const FIXED_COLUMNS: [&str; 5] = [
  "time_period",
  "time_identifier",
  "geographic_level",
  "location_code",
  "location_name",
];

/// Encodes observation rows for one subject and indicator selection.
#[derive(Debug, Clone)]
pub struct ExportWriter {
  /// Filter id and column name, in meta order.
  filters:    Vec<(Uuid, String)>,
  /// Filter item id to (owning filter id, label).
  items:      HashMap<Uuid, (Uuid, String)>,
  /// Indicator id and column name, in selection order.
  indicators: Vec<(Uuid, String)>,
}

impl ExportWriter {
  /// `indicators` selects and orders the indicator columns; ids unknown to
  /// `meta` are skipped.
  pub fn new(meta: &SubjectMeta, indicators: &[Uuid]) -> Self {
    let filters = meta
      .filters
      .iter()
      .map(|f| (f.filter.filter_id, f.filter.name.clone()))
      .collect();
    let items = meta
      .filters
      .iter()
      .flat_map(|f| {
        f.items()
          .map(move |i| (i.filter_item_id, (f.filter.filter_id, i.label.clone())))
      })
      .collect();
    let indicators = indicators
      .iter()
      .filter_map(|id| meta.indicator(*id).map(|i| (i.indicator_id, i.name.clone())))
      .collect();
    Self { filters, items, indicators }
  }

  pub fn columns(&self) -> Vec<&str> {
    FIXED_COLUMNS
      .iter()
      .copied()
      .chain(self.filters.iter().map(|(_, name)| name.as_str()))
      .chain(self.indicators.iter().map(|(_, name)| name.as_str()))
      .collect()
  }

  /// The header line.
  pub fn header(&self) -> Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(self.columns())?;
    Ok(w.into_inner()?)
  }

  /// Encode one chunk of rows, without a header.
  pub fn rows(&self, rows: &[ObservationRow]) -> Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    for row in rows {
      w.write_record(self.record(row))?;
    }
    Ok(w.into_inner()?)
  }

  fn record(&self, row: &ObservationRow) -> Vec<String> {
    let mut out = Vec::with_capacity(FIXED_COLUMNS.len() + self.filters.len() + self.indicators.len());
    out.push(row.time_period.format_period());
    out.push(row.time_period.identifier.label());
    out.push(row.geographic_level.label().to_owned());
    out.push(row.location.code.clone());
    out.push(row.location.name.clone());

    for (filter_id, _) in &self.filters {
      let label = row
        .filters
        .iter()
        .filter_map(|id| self.items.get(id))
        .find(|(owner, _)| owner == filter_id)
        .map(|(_, label)| label.clone())
        .unwrap_or_default();
      out.push(label);
    }
    for (indicator_id, _) in &self.indicators {
      out.push(row.values.get(indicator_id).cloned().unwrap_or_default());
    }
    out
  }
}
