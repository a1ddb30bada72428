//! The meta-CSV dialect.
//!
//! One row per data column that is a filter or an indicator:
//!
//! ```text
//! col_name,col_type,label,indicator_grouping,indicator_unit,indicator_dp,filter_hint,filter_grouping_column
//! school_type,Filter,School type,,,,,
//! sess_overall,Indicator,Overall absence,Absence,%,1,,
//! ```
//!
//! Only the first three columns are required.

use std::collections::{BTreeSet, HashMap};

use strata_core::dimension::{DEFAULT_GROUP, SubjectMeta};

use crate::{
  Error, Result,
  error::RowError,
};

const COL_NAME: &str = "col_name";
const COL_TYPE: &str = "col_type";
const LABEL: &str = "label";
const INDICATOR_GROUPING: &str = "indicator_grouping";
const INDICATOR_UNIT: &str = "indicator_unit";
const INDICATOR_DP: &str = "indicator_dp";
const FILTER_HINT: &str = "filter_hint";
const FILTER_GROUPING_COLUMN: &str = "filter_grouping_column";

const REQUIRED: [&str; 3] = [COL_NAME, COL_TYPE, LABEL];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaFilter {
  pub name:            String,
  pub label:           String,
  pub hint:            Option<String>,
  pub grouping_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaIndicator {
  pub name:           String,
  pub label:          String,
  pub group:          String,
  pub unit:           Option<String>,
  pub decimal_places: Option<u8>,
}

/// The filter and indicator columns of one data file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaSchema {
  pub filters:    Vec<MetaFilter>,
  pub indicators: Vec<MetaIndicator>,
}

impl MetaSchema {
  /// Every data column this schema names, including grouping columns.
  pub fn referenced_columns(&self) -> BTreeSet<&str> {
    self
      .filters
      .iter()
      .flat_map(|f| std::iter::once(f.name.as_str()).chain(f.grouping_column.as_deref()))
      .chain(self.indicators.iter().map(|i| i.name.as_str()))
      .collect()
  }
}

/// Rebuild the schema of an already-imported subject, so headerless batches
/// can be parsed without the original meta file.
impl From<&SubjectMeta> for MetaSchema {
  fn from(meta: &SubjectMeta) -> Self {
    let group_labels: HashMap<_, _> = meta
      .indicator_groups
      .iter()
      .map(|g| (g.indicator_group_id, g.label.as_str()))
      .collect();

    Self {
      filters:    meta
        .filters
        .iter()
        .map(|f| MetaFilter {
          name:            f.filter.name.clone(),
          label:           f.filter.label.clone(),
          hint:            f.filter.hint.clone(),
          grouping_column: f.filter.grouping_column.clone(),
        })
        .collect(),
      indicators: meta
        .indicators
        .iter()
        .map(|i| MetaIndicator {
          name:           i.name.clone(),
          label:          i.label.clone(),
          group:          group_labels
            .get(&i.indicator_group_id)
            .copied()
            .unwrap_or(DEFAULT_GROUP)
            .to_owned(),
          unit:           i.unit.clone(),
          decimal_places: i.decimal_places,
        })
        .collect(),
    }
  }
}

fn non_empty(field: Option<&str>) -> Option<String> {
  field.map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned)
}

/// Parse and validate a meta file. Every row is checked; all problems are
/// reported together.
pub fn parse_meta(input: &[u8]) -> Result<MetaSchema> {
  let mut reader = csv::ReaderBuilder::new()
    .has_headers(true)
    .flexible(true)
    .trim(csv::Trim::Headers)
    .from_reader(input);

  let headers = reader.headers()?.clone();
  if headers.is_empty() {
    return Err(Error::MissingHeader);
  }
  let index: HashMap<&str, usize> = headers.iter().enumerate().map(|(i, h)| (h, i)).collect();

  let missing: Vec<RowError> = REQUIRED
    .iter()
    .filter(|col| !index.contains_key(*col))
    .map(|col| RowError::column(*col, "required column is missing"))
    .collect();
  if !missing.is_empty() {
    return Err(Error::Invalid(missing));
  }

  let mut schema = MetaSchema::default();
  let mut errors = Vec::new();
  let mut seen = BTreeSet::new();

  for (i, record) in reader.records().enumerate() {
    let row = i as u64 + 1;
    let record = record?;
    let get = |col: &str| index.get(col).and_then(|&i| record.get(i));

    let Some(name) = non_empty(get(COL_NAME)) else {
      errors.push(RowError::at(row, Some(COL_NAME), "column name is empty"));
      continue;
    };
    if !seen.insert(name.clone()) {
      errors.push(RowError::at(row, Some(COL_NAME), format!("duplicate column {name:?}")));
      continue;
    }
    let label = non_empty(get(LABEL)).unwrap_or_else(|| name.clone());

    match get(COL_TYPE).map(str::trim) {
      Some(t) if t.eq_ignore_ascii_case("Filter") => schema.filters.push(MetaFilter {
        name,
        label,
        hint: non_empty(get(FILTER_HINT)),
        grouping_column: non_empty(get(FILTER_GROUPING_COLUMN)),
      }),
      Some(t) if t.eq_ignore_ascii_case("Indicator") => {
        let decimal_places = match non_empty(get(INDICATOR_DP)) {
          None => None,
          Some(dp) => match dp.parse::<u8>() {
            Ok(dp) => Some(dp),
            Err(_) => {
              errors.push(RowError::at(
                row,
                Some(INDICATOR_DP),
                format!("{dp:?} is not a number of decimal places"),
              ));
              continue;
            }
          },
        };
        schema.indicators.push(MetaIndicator {
          name,
          label,
          group: non_empty(get(INDICATOR_GROUPING)).unwrap_or_else(|| DEFAULT_GROUP.to_owned()),
          unit: non_empty(get(INDICATOR_UNIT)),
          decimal_places,
        });
      }
      other => errors.push(RowError::at(
        row,
        Some(COL_TYPE),
        format!("unknown column type {:?}", other.unwrap_or_default()),
      )),
    }
  }

  if seen.is_empty() && errors.is_empty() {
    errors.push(RowError::header("meta file has no rows"));
  }
  if schema.indicators.is_empty() && errors.is_empty() {
    errors.push(RowError::header("meta file declares no indicators"));
  }

  if errors.is_empty() { Ok(schema) } else { Err(Error::Invalid(errors)) }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ABSENCE_META: &str = "\
col_name,col_type,label,indicator_grouping,indicator_unit,indicator_dp,filter_hint,filter_grouping_column
school_type,Filter,School type,,,,Filter by school type,
sess_overall_percent,Indicator,Overall absence rate,Absence fields,%,1,,
";

  #[test]
  fn parses_filters_and_indicators() {
    let schema = parse_meta(ABSENCE_META.as_bytes()).unwrap();
    assert_eq!(schema.filters.len(), 1);
    assert_eq!(schema.filters[0].name, "school_type");
    assert_eq!(schema.filters[0].hint.as_deref(), Some("Filter by school type"));
    assert_eq!(schema.filters[0].grouping_column, None);

    let ind = &schema.indicators[0];
    assert_eq!(ind.name, "sess_overall_percent");
    assert_eq!(ind.group, "Absence fields");
    assert_eq!(ind.unit.as_deref(), Some("%"));
    assert_eq!(ind.decimal_places, Some(1));
  }

  #[test]
  fn optional_columns_may_be_absent() {
    let input = "col_name,col_type,label\nenrolments,Indicator,Enrolments\n";
    let schema = parse_meta(input.as_bytes()).unwrap();
    assert_eq!(schema.indicators[0].group, DEFAULT_GROUP);
    assert_eq!(schema.indicators[0].decimal_places, None);
  }

  #[test]
  fn missing_required_column_is_reported() {
    let err = parse_meta(b"col_name,label\nx,X\n").unwrap_err();
    let errors = err.row_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].column.as_deref(), Some("col_type"));
  }

  #[test]
  fn every_bad_row_is_reported() {
    let input = "\
col_name,col_type,label,indicator_dp
a,Indicator,A,1
a,Indicator,A again,
b,Measure,B,
c,Indicator,C,two
";
    let errors = parse_meta(input.as_bytes()).unwrap_err().row_errors();
    let rows: Vec<_> = errors.iter().map(|e| e.row).collect();
    assert_eq!(rows, vec![Some(2), Some(3), Some(4)]);
    assert!(errors[0].message.contains("duplicate"));
    assert!(errors[1].message.contains("Measure"));
  }

  #[test]
  fn empty_meta_is_invalid() {
    assert!(parse_meta(b"col_name,col_type,label\n").is_err());
  }
}
