//! Data-file header checks and row parsing.
//!
//! A data file carries three mandatory columns (`time_period`,
//! `time_identifier`, `geographic_level`), the location columns for whichever
//! levels it uses, and one column per filter and indicator named in its meta
//! file. Any other column is ignored.

use std::collections::HashMap;

use csv::StringRecord;
use strata_core::{
  dimension::{DEFAULT_GROUP, GeographicLevel, NewLocation},
  time::{TimeIdentifier, TimePeriod},
};

use crate::{
  Error, Result,
  error::RowError,
  meta::MetaSchema,
};

pub const TIME_PERIOD: &str = "time_period";
pub const TIME_IDENTIFIER: &str = "time_identifier";
pub const GEOGRAPHIC_LEVEL: &str = "geographic_level";

pub const MANDATORY_COLUMNS: [&str; 3] = [TIME_PERIOD, TIME_IDENTIFIER, GEOGRAPHIC_LEVEL];

/// Indicator cell values that stand in for a number.
pub const SUPPRESSION_SYMBOLS: [&str; 9] = ["c", "x", "z", ":", "~", "..", "low", "u", "k"];

/// Whether `value` is acceptable in an indicator column: empty, a
/// suppression symbol, or a number.
pub fn is_valid_indicator_value(value: &str) -> bool {
  let v = value.trim();
  v.is_empty()
    || SUPPRESSION_SYMBOLS.iter().any(|s| s.eq_ignore_ascii_case(v))
    || v.parse::<f64>().is_ok_and(f64::is_finite)
}

// ─── Header ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
  columns: Vec<String>,
  index:   HashMap<String, usize>,
}

impl DataHeader {
  pub fn new(columns: Vec<String>) -> Self {
    let columns: Vec<String> = columns.into_iter().map(|c| c.trim().to_owned()).collect();
    let index = columns.iter().enumerate().map(|(i, c)| (c.clone(), i)).collect();
    Self { columns, index }
  }

  /// Read the header row of a data file.
  pub fn read(input: &[u8]) -> Result<Self> {
    let mut reader = data_reader(input, true);
    let headers = reader.headers()?;
    if headers.is_empty() || headers.iter().all(str::is_empty) {
      return Err(Error::MissingHeader);
    }
    Ok(Self::new(headers.iter().map(str::to_owned).collect()))
  }

  pub fn columns(&self) -> &[String] { &self.columns }

  pub fn len(&self) -> usize { self.columns.len() }

  pub fn is_empty(&self) -> bool { self.columns.is_empty() }

  pub fn position(&self, column: &str) -> Option<usize> { self.index.get(column).copied() }

  pub fn contains(&self, column: &str) -> bool { self.index.contains_key(column) }

  /// Check the header against the meta file that describes it: mandatory
  /// columns present, every meta column and grouping column present, and at
  /// least one location column.
  pub fn validate_against(&self, meta: &MetaSchema) -> Result<(), Vec<RowError>> {
    let mut errors = Vec::new();

    for col in MANDATORY_COLUMNS {
      if !self.contains(col) {
        errors.push(RowError::column(col, "required column is missing from the data file"));
      }
    }
    for filter in &meta.filters {
      if !self.contains(&filter.name) {
        errors.push(RowError::column(&filter.name, "filter column is missing from the data file"));
      }
      if let Some(group) = &filter.grouping_column
        && !self.contains(group)
      {
        errors.push(RowError::column(
          group,
          format!("grouping column of filter {:?} is missing from the data file", filter.name),
        ));
      }
    }
    for indicator in &meta.indicators {
      if !self.contains(&indicator.name) {
        errors.push(RowError::column(
          &indicator.name,
          "indicator column is missing from the data file",
        ));
      }
    }
    if !GeographicLevel::all_location_columns()
      .iter()
      .any(|c| self.contains(c))
    {
      errors.push(RowError::header("data file has no location columns"));
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
  }
}

/// A CSV reader configured for data files. Field counts are checked per row
/// by [`RowParser`] rather than by the reader.
pub fn data_reader(input: &[u8], has_headers: bool) -> csv::Reader<&[u8]> {
  csv::ReaderBuilder::new()
    .has_headers(has_headers)
    .flexible(true)
    .from_reader(input)
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// A filter cell, with the group it falls under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterValue {
  pub filter: String,
  pub group:  String,
  pub item:   String,
}

/// A validated data row, expressed in natural keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRow {
  /// 1-based data row number within the source file.
  pub row_no:           u64,
  pub time_period:      TimePeriod,
  pub geographic_level: GeographicLevel,
  pub location:         NewLocation,
  pub filters:          Vec<FilterValue>,
  /// Indicator column name to the exact source string.
  pub values:           Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct FilterColumn {
  name:  String,
  index: usize,
  group: Option<usize>,
}

#[derive(Debug, Clone)]
struct IndicatorColumn {
  name:  String,
  index: usize,
}

/// Parses data rows against a header and meta schema.
#[derive(Debug, Clone)]
pub struct RowParser {
  header:           DataHeader,
  time_period:      usize,
  time_identifier:  usize,
  geographic_level: usize,
  filters:          Vec<FilterColumn>,
  indicators:       Vec<IndicatorColumn>,
}

impl RowParser {
  pub fn new(header: DataHeader, meta: &MetaSchema) -> Result<Self, Vec<RowError>> {
    header.validate_against(meta)?;
    let pos = |c: &str| header.position(c).unwrap_or_default();

    let filters = meta
      .filters
      .iter()
      .map(|f| FilterColumn {
        name:  f.name.clone(),
        index: pos(&f.name),
        group: f.grouping_column.as_deref().and_then(|g| header.position(g)),
      })
      .collect();
    let indicators = meta
      .indicators
      .iter()
      .map(|i| IndicatorColumn { name: i.name.clone(), index: pos(&i.name) })
      .collect();

    Ok(Self {
      time_period: pos(TIME_PERIOD),
      time_identifier: pos(TIME_IDENTIFIER),
      geographic_level: pos(GEOGRAPHIC_LEVEL),
      filters,
      indicators,
      header,
    })
  }

  pub fn header(&self) -> &DataHeader { &self.header }

  /// Validate and decode one record. All problems on the row are reported.
  pub fn parse(&self, row_no: u64, record: &StringRecord) -> Result<ParsedRow, Vec<RowError>> {
    if record.len() != self.header.len() {
      return Err(vec![RowError::at(
        row_no,
        None,
        format!("expected {} fields, found {}", self.header.len(), record.len()),
      )]);
    }
    let cell = |i: usize| record.get(i).unwrap_or_default().trim();
    let mut errors = Vec::new();

    let identifier = match TimeIdentifier::from_label(cell(self.time_identifier)) {
      Ok(id) => Some(id),
      Err(e) => {
        errors.push(RowError::at(row_no, Some(TIME_IDENTIFIER), e.to_string()));
        None
      }
    };
    let time_period = identifier.and_then(|id| match TimePeriod::parse(cell(self.time_period), id) {
      Ok(p) => Some(p),
      Err(e) => {
        errors.push(RowError::at(row_no, Some(TIME_PERIOD), e.to_string()));
        None
      }
    });

    let level = match GeographicLevel::from_label(cell(self.geographic_level)) {
      Ok(level) => Some(level),
      Err(e) => {
        errors.push(RowError::at(row_no, Some(GEOGRAPHIC_LEVEL), e.to_string()));
        None
      }
    };
    let location = level.and_then(|level| {
      let cols = level.columns();
      let code = cols
        .code
        .iter()
        .filter_map(|c| self.header.position(c))
        .map(cell)
        .find(|v| !v.is_empty());
      match code {
        Some(code) => {
          let name = self
            .header
            .position(cols.name)
            .map(cell)
            .filter(|v| !v.is_empty())
            .unwrap_or(code);
          Some(NewLocation { level, code: code.to_owned(), name: name.to_owned() })
        }
        None => {
          errors.push(RowError::at(
            row_no,
            cols.code.first().copied(),
            format!("missing location code for level {:?}", level.label()),
          ));
          None
        }
      }
    });

    let mut filters = Vec::with_capacity(self.filters.len());
    for f in &self.filters {
      let item = cell(f.index);
      if item.is_empty() {
        errors.push(RowError::at(row_no, Some(&f.name), "filter value is empty"));
        continue;
      }
      let group = f
        .group
        .map(cell)
        .filter(|g| !g.is_empty())
        .unwrap_or(DEFAULT_GROUP);
      filters.push(FilterValue {
        filter: f.name.clone(),
        group:  group.to_owned(),
        item:   item.to_owned(),
      });
    }

    let mut values = Vec::with_capacity(self.indicators.len());
    for ind in &self.indicators {
      let raw = record.get(ind.index).unwrap_or_default();
      if is_valid_indicator_value(raw) {
        values.push((ind.name.clone(), raw.to_owned()));
      } else {
        errors.push(RowError::at(
          row_no,
          Some(&ind.name),
          format!("{raw:?} is neither a number nor a suppression symbol"),
        ));
      }
    }

    match (time_period, level, location) {
      (Some(time_period), Some(geographic_level), Some(location)) if errors.is_empty() => {
        Ok(ParsedRow { row_no, time_period, geographic_level, location, filters, values })
      }
      _ => Err(errors),
    }
  }

  /// Parse every record of `input`, numbering rows from `first_row`.
  /// Returns the rows that parsed and every error found.
  pub fn parse_all(
    &self,
    input: &[u8],
    has_headers: bool,
    first_row: u64,
  ) -> Result<(Vec<ParsedRow>, Vec<RowError>)> {
    let mut reader = data_reader(input, has_headers);
    let mut rows = Vec::new();
    let mut errors = Vec::new();
    for (i, record) in reader.records().enumerate() {
      let record = record?;
      match self.parse(first_row + i as u64, &record) {
        Ok(row) => rows.push(row),
        Err(e) => errors.extend(e),
      }
    }
    Ok((rows, errors))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::meta::parse_meta;

  const META: &str = "\
col_name,col_type,label,indicator_grouping,indicator_unit,indicator_dp,filter_hint,filter_grouping_column
school_type,Filter,School type,,,,,school_phase
enrolments,Indicator,Enrolments,,,,,
";

  const HEADER: &str =
    "time_period,time_identifier,geographic_level,country_code,country_name,new_la_code,old_la_code,la_name,school_phase,school_type,enrolments";

  fn parser() -> RowParser {
    let meta = parse_meta(META.as_bytes()).unwrap();
    let header = DataHeader::read(HEADER.as_bytes()).unwrap();
    RowParser::new(header, &meta).unwrap()
  }

  fn record(line: &str) -> StringRecord {
    data_reader(line.as_bytes(), false)
      .records()
      .next()
      .unwrap()
      .unwrap()
  }

  #[test]
  fn parses_national_row() {
    let row = parser()
      .parse(1, &record("201819,Academic year,National,E92000001,England,,,,Primary,State-funded,4500"))
      .unwrap();
    assert_eq!(row.time_period, TimePeriod::new(2018, TimeIdentifier::AcademicYear));
    assert_eq!(row.geographic_level, GeographicLevel::Country);
    assert_eq!(row.location.code, "E92000001");
    assert_eq!(row.location.name, "England");
    assert_eq!(row.filters, vec![FilterValue {
      filter: "school_type".into(),
      group:  "Primary".into(),
      item:   "State-funded".into(),
    }]);
    assert_eq!(row.values, vec![("enrolments".into(), "4500".into())]);
  }

  #[test]
  fn local_authority_falls_back_to_old_code() {
    let row = parser()
      .parse(2, &record("2020,Calendar year,Local authority,,,,202,Camden,,Special,x"))
      .unwrap();
    assert_eq!(row.location.code, "202");
    assert_eq!(row.filters[0].group, DEFAULT_GROUP);
    assert_eq!(row.values[0].1, "x");
  }

  #[test]
  fn collects_every_error_on_a_row() {
    let errors = parser()
      .parse(7, &record("2018,Academic year,Galaxy,,,,,,,,lots"))
      .unwrap_err();
    let cols: Vec<_> = errors.iter().map(|e| e.column.as_deref()).collect();
    assert_eq!(cols, vec![
      Some(TIME_PERIOD),
      Some(GEOGRAPHIC_LEVEL),
      Some("school_type"),
      Some("enrolments")
    ]);
    assert!(errors.iter().all(|e| e.row == Some(7)));
  }

  #[test]
  fn wrong_field_count_is_rejected() {
    let errors = parser().parse(3, &record("2018,Calendar year")).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("expected 11 fields"));
  }

  #[test]
  fn header_must_cover_meta() {
    let meta = parse_meta(META.as_bytes()).unwrap();
    let header = DataHeader::new(vec!["time_period".into(), "country_code".into()]);
    let errors = header.validate_against(&meta).unwrap_err();
    let cols: Vec<_> = errors.iter().filter_map(|e| e.column.as_deref()).collect();
    assert!(cols.contains(&TIME_IDENTIFIER));
    assert!(cols.contains(&"school_type"));
    assert!(cols.contains(&"school_phase"));
    assert!(cols.contains(&"enrolments"));
  }

  #[test]
  fn indicator_values() {
    for ok in ["", "12", "-3.5", "1e3", "c", "X", "..", "low", " 7 "] {
      assert!(is_valid_indicator_value(ok), "{ok:?}");
    }
    for bad in ["n/a", "12%", "NaN", "inf"] {
      assert!(!is_valid_indicator_value(bad), "{bad:?}");
    }
  }

  #[test]
  fn parse_all_numbers_rows_from_offset() {
    let body = "2019,Calendar year,National,E92000001,England,,,,,A,1\n\
                2019,Calendar year,National,E92000001,England,,,,,B,oops\n";
    let (rows, errors) = parser().parse_all(body.as_bytes(), false, 101).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_no, 101);
    assert_eq!(errors[0].row, Some(102));
  }
}
