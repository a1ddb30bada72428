//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings. Enums are stored as their
//! canonical names (`LocalAuthority`, `IMPORT_OBSERVATIONS`, `AY`). Maps and
//! lists are stored as compact JSON. UUIDs are stored as hyphenated lowercase
//! strings.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rusqlite::Row;
use strata_core::{
  dimension::{Filter, FilterGroup, FilterItem, GeographicLevel, Indicator, IndicatorGroup, Location, Subject},
  footnote::{Footnote, FootnoteScope},
  import::{ImportErrorEntry, ImportRecord, ImportStatus},
  message::ImportMessage,
  observation::ObservationRow,
  time::{TimeIdentifier, TimePeriod},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Enums ───────────────────────────────────────────────────────────────────

pub fn encode_level(level: GeographicLevel) -> String { level.as_ref().to_owned() }

pub fn decode_level(s: &str) -> Result<GeographicLevel> {
  s.parse().map_err(|_| Error::Decode { kind: "geographic level", value: s.to_owned() })
}

pub fn decode_status(s: &str) -> Result<ImportStatus> {
  s.parse().map_err(|_| Error::Decode { kind: "import status", value: s.to_owned() })
}

pub fn decode_time_period(year: i64, code: &str) -> Result<TimePeriod> {
  let year = i32::try_from(year).map_err(|_| Error::Decode { kind: "year", value: year.to_string() })?;
  Ok(TimePeriod::new(year, TimeIdentifier::from_code(code)?))
}

// ─── Footnote scopes ─────────────────────────────────────────────────────────

pub fn encode_scope(scope: FootnoteScope) -> (&'static str, String) {
  match scope {
    FootnoteScope::Subject(id) => ("subject", encode_uuid(id)),
    FootnoteScope::Filter(id) => ("filter", encode_uuid(id)),
    FootnoteScope::FilterGroup(id) => ("filterGroup", encode_uuid(id)),
    FootnoteScope::FilterItem(id) => ("filterItem", encode_uuid(id)),
    FootnoteScope::Indicator(id) => ("indicator", encode_uuid(id)),
  }
}

pub fn decode_scope(kind: &str, id: &str) -> Result<FootnoteScope> {
  let id = decode_uuid(id)?;
  match kind {
    "subject" => Ok(FootnoteScope::Subject(id)),
    "filter" => Ok(FootnoteScope::Filter(id)),
    "filterGroup" => Ok(FootnoteScope::FilterGroup(id)),
    "filterItem" => Ok(FootnoteScope::FilterItem(id)),
    "indicator" => Ok(FootnoteScope::Indicator(id)),
    other => Err(Error::Decode { kind: "footnote scope", value: other.to_owned() }),
  }
}

// ─── Measures ────────────────────────────────────────────────────────────────

pub fn encode_measures(measures: &BTreeMap<Uuid, String>) -> Result<String> {
  Ok(serde_json::to_string(measures)?)
}

pub fn decode_measures(s: &str) -> Result<BTreeMap<Uuid, String>> { Ok(serde_json::from_str(s)?) }

/// JSON path selecting one indicator's value from the `measures` column.
pub fn measure_path(indicator_id: Uuid) -> String { format!("$.\"{}\"", encode_uuid(indicator_id)) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read directly from a `subjects` row.
pub struct RawSubject {
  pub subject_id: String,
  pub release_id: String,
  pub name:       String,
  pub created_at: String,
}

impl RawSubject {
  pub const COLUMNS: &'static str = "subject_id, release_id, name, created_at";

  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subject_id: row.get(0)?,
      release_id: row.get(1)?,
      name:       row.get(2)?,
      created_at: row.get(3)?,
    })
  }

  pub fn into_subject(self) -> Result<Subject> {
    Ok(Subject {
      subject_id: decode_uuid(&self.subject_id)?,
      release_id: decode_uuid(&self.release_id)?,
      name:       self.name,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}

pub struct RawLocation {
  pub location_id:      String,
  pub geographic_level: String,
  pub code:             String,
  pub name:             String,
}

impl RawLocation {
  pub const COLUMNS: &'static str = "location_id, geographic_level, code, name";

  /// Read the four location columns starting at `offset`.
  pub fn from_row_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
    Ok(Self {
      location_id:      row.get(offset)?,
      geographic_level: row.get(offset + 1)?,
      code:             row.get(offset + 2)?,
      name:             row.get(offset + 3)?,
    })
  }

  pub fn into_location(self) -> Result<Location> {
    Ok(Location {
      location_id: decode_uuid(&self.location_id)?,
      level:       decode_level(&self.geographic_level)?,
      code:        self.code,
      name:        self.name,
    })
  }
}

pub struct RawFilter {
  pub filter_id:       String,
  pub subject_id:      String,
  pub name:            String,
  pub label:           String,
  pub hint:            Option<String>,
  pub grouping_column: Option<String>,
}

impl RawFilter {
  pub const COLUMNS: &'static str = "filter_id, subject_id, name, label, hint, grouping_column";

  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      filter_id:       row.get(0)?,
      subject_id:      row.get(1)?,
      name:            row.get(2)?,
      label:           row.get(3)?,
      hint:            row.get(4)?,
      grouping_column: row.get(5)?,
    })
  }

  pub fn into_filter(self) -> Result<Filter> {
    Ok(Filter {
      filter_id:       decode_uuid(&self.filter_id)?,
      subject_id:      decode_uuid(&self.subject_id)?,
      name:            self.name,
      label:           self.label,
      hint:            self.hint,
      grouping_column: self.grouping_column,
    })
  }
}

/// A `filter_groups` or `filter_items` row: own id, parent id, label.
pub struct RawChild {
  pub id:        String,
  pub parent_id: String,
  pub label:     String,
}

impl RawChild {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self { id: row.get(0)?, parent_id: row.get(1)?, label: row.get(2)? })
  }

  pub fn into_filter_group(self) -> Result<FilterGroup> {
    Ok(FilterGroup {
      filter_group_id: decode_uuid(&self.id)?,
      filter_id:       decode_uuid(&self.parent_id)?,
      label:           self.label,
    })
  }

  pub fn into_filter_item(self) -> Result<FilterItem> {
    Ok(FilterItem {
      filter_item_id:  decode_uuid(&self.id)?,
      filter_group_id: decode_uuid(&self.parent_id)?,
      label:           self.label,
    })
  }

  pub fn into_indicator_group(self) -> Result<IndicatorGroup> {
    Ok(IndicatorGroup {
      indicator_group_id: decode_uuid(&self.id)?,
      subject_id:         decode_uuid(&self.parent_id)?,
      label:              self.label,
    })
  }
}

pub struct RawIndicator {
  pub indicator_id:       String,
  pub indicator_group_id: String,
  pub subject_id:         String,
  pub name:               String,
  pub label:              String,
  pub unit:               Option<String>,
  pub decimal_places:     Option<i64>,
}

impl RawIndicator {
  pub const COLUMNS: &'static str =
    "indicator_id, indicator_group_id, subject_id, name, label, unit, decimal_places";

  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      indicator_id:       row.get(0)?,
      indicator_group_id: row.get(1)?,
      subject_id:         row.get(2)?,
      name:               row.get(3)?,
      label:              row.get(4)?,
      unit:               row.get(5)?,
      decimal_places:     row.get(6)?,
    })
  }

  pub fn into_indicator(self) -> Result<Indicator> {
    Ok(Indicator {
      indicator_id:       decode_uuid(&self.indicator_id)?,
      indicator_group_id: decode_uuid(&self.indicator_group_id)?,
      subject_id:         decode_uuid(&self.subject_id)?,
      name:               self.name,
      label:              self.label,
      unit:               self.unit,
      decimal_places:     self.decimal_places.and_then(|dp| u8::try_from(dp).ok()),
    })
  }
}

/// Raw strings read from an `imports` row plus its batch count.
pub struct RawImport {
  pub import_id:         String,
  pub subject_id:        String,
  pub release_id:        String,
  pub data_file_name:    String,
  pub meta_file_name:    String,
  pub status:            String,
  pub rows_per_batch:    i64,
  pub total_rows:        i64,
  pub num_batches:       i64,
  pub imported_rows:     i64,
  pub geographic_levels: String,
  pub data_columns:      String,
  pub last_message:      Option<String>,
  pub errors:            String,
  pub checksum:          Option<String>,
  pub created_at:        String,
  pub updated_at:        String,
  pub completed_batches: i64,
}

impl RawImport {
  /// Select list for `imports i`, ending with the recorded batch count.
  pub const COLUMNS: &'static str = "i.import_id, i.subject_id, i.release_id, i.data_file_name,
     i.meta_file_name, i.status, i.rows_per_batch, i.total_rows, i.num_batches,
     i.imported_rows, i.geographic_levels, i.data_columns, i.last_message, i.errors,
     i.checksum, i.created_at, i.updated_at,
     (SELECT COUNT(*) FROM import_batches b WHERE b.import_id = i.import_id)";

  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      import_id:         row.get(0)?,
      subject_id:        row.get(1)?,
      release_id:        row.get(2)?,
      data_file_name:    row.get(3)?,
      meta_file_name:    row.get(4)?,
      status:            row.get(5)?,
      rows_per_batch:    row.get(6)?,
      total_rows:        row.get(7)?,
      num_batches:       row.get(8)?,
      imported_rows:     row.get(9)?,
      geographic_levels: row.get(10)?,
      data_columns:      row.get(11)?,
      last_message:      row.get(12)?,
      errors:            row.get(13)?,
      checksum:          row.get(14)?,
      created_at:        row.get(15)?,
      updated_at:        row.get(16)?,
      completed_batches: row.get(17)?,
    })
  }

  pub fn into_record(self) -> Result<ImportRecord> {
    let last_message: Option<ImportMessage> = self
      .last_message
      .as_deref()
      .map(serde_json::from_str)
      .transpose()?;
    let geographic_levels: BTreeSet<GeographicLevel> =
      serde_json::from_str(&self.geographic_levels)?;
    let errors: Vec<ImportErrorEntry> = serde_json::from_str(&self.errors)?;

    Ok(ImportRecord {
      import_id: decode_uuid(&self.import_id)?,
      subject_id: decode_uuid(&self.subject_id)?,
      release_id: decode_uuid(&self.release_id)?,
      data_file_name: self.data_file_name,
      meta_file_name: self.meta_file_name,
      status: decode_status(&self.status)?,
      rows_per_batch: non_negative(self.rows_per_batch),
      total_rows: non_negative(self.total_rows),
      num_batches: non_negative(self.num_batches),
      imported_rows: non_negative(self.imported_rows),
      completed_batches: non_negative(self.completed_batches),
      geographic_levels,
      data_columns: serde_json::from_str(&self.data_columns)?,
      last_message,
      errors,
      checksum: self.checksum,
      created_at: decode_dt(&self.created_at)?,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}

pub fn non_negative<T: TryFrom<i64> + Default>(v: i64) -> T { T::try_from(v).unwrap_or_default() }

/// An observation joined with its location and filter items.
pub struct RawObservation {
  pub rowid:            i64,
  pub observation_id:   String,
  pub geographic_level: String,
  pub year:             i64,
  pub time_identifier:  String,
  pub measures:         String,
  pub location:         RawLocation,
  /// Comma-separated filter item ids, `NULL` when the row has none.
  pub filter_items:     Option<String>,
}

impl RawObservation {
  /// Select list for `observations o JOIN locations l`.
  pub const COLUMNS: &'static str = "o.rowid, o.observation_id, o.geographic_level, o.year,
     o.time_identifier, o.measures,
     l.location_id, l.geographic_level, l.code, l.name,
     (SELECT group_concat(f.filter_item_id) FROM observation_filter_items f
        WHERE f.observation_id = o.observation_id)";

  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      rowid:            row.get(0)?,
      observation_id:   row.get(1)?,
      geographic_level: row.get(2)?,
      year:             row.get(3)?,
      time_identifier:  row.get(4)?,
      measures:         row.get(5)?,
      location:         RawLocation::from_row_at(row, 6)?,
      filter_items:     row.get(10)?,
    })
  }

  /// Decode, keeping only the values of `indicators`.
  pub fn into_row(self, indicators: &[Uuid]) -> Result<ObservationRow> {
    let mut filters = self
      .filter_items
      .as_deref()
      .unwrap_or_default()
      .split(',')
      .filter(|s| !s.is_empty())
      .map(decode_uuid)
      .collect::<Result<Vec<_>>>()?;
    filters.sort();

    let mut values = decode_measures(&self.measures)?;
    values.retain(|id, _| indicators.contains(id));

    Ok(ObservationRow {
      observation_id: decode_uuid(&self.observation_id)?,
      geographic_level: decode_level(&self.geographic_level)?,
      location: self.location.into_location()?,
      time_period: decode_time_period(self.year, &self.time_identifier)?,
      filters,
      values,
    })
  }
}

pub struct RawFootnote {
  pub footnote_id: String,
  pub content:     String,
  pub created_at:  String,
  /// `(scope_type, target_id)` pairs.
  pub scopes:      Vec<(String, String)>,
}

impl RawFootnote {
  pub fn into_footnote(self) -> Result<Footnote> {
    Ok(Footnote {
      footnote_id: decode_uuid(&self.footnote_id)?,
      content:     self.content,
      scopes:      self
        .scopes
        .iter()
        .map(|(kind, id)| decode_scope(kind, id))
        .collect::<Result<_>>()?,
      created_at:  decode_dt(&self.created_at)?,
    })
  }
}
