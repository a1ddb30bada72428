//! Typed faceted-query AST.
//!
//! A query is a boolean tree of `and` / `or` / `not` nodes whose leaves are
//! [`Criteria`]. On the wire:
//!
//! ```json
//! { "and": [
//!     { "filters": { "in": ["…"] } },
//!     { "timePeriods": { "gte": { "year": 2020, "code": "AY" } } }
//! ] }
//! ```
//!
//! Leaves may also be wrapped as `{ "criteria": { … } }`. An empty object is a
//! leaf with no constraints and matches every observation of the subject.
//! Storage backends compile the tree into their native predicate form; this
//! module only parses and validates it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  dimension::{GeographicLevel, SubjectMeta},
  time::TimePeriod,
};

/// Deepest nesting accepted before a query is rejected.
pub const MAX_DEPTH: usize = 32;

// ─── Comparisons ─────────────────────────────────────────────────────────────

/// Equality / membership operators. All present operators must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
  rename_all = "camelCase",
  deny_unknown_fields,
  bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>")
)]
pub struct Comparison<T> {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub eq:     Option<T>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub not_eq: Option<T>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub r#in:   Option<Vec<T>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub not_in: Option<Vec<T>>,
}

impl<T> Default for Comparison<T> {
  fn default() -> Self { Self { eq: None, not_eq: None, r#in: None, not_in: None } }
}

impl<T> Comparison<T> {
  pub fn any_of(values: Vec<T>) -> Self { Self { r#in: Some(values), ..Self::default() } }

  pub fn is_empty(&self) -> bool {
    self.eq.is_none() && self.not_eq.is_none() && self.r#in.is_none() && self.not_in.is_none()
  }

  /// Every value mentioned by any operator, with its field suffix.
  pub fn values(&self) -> Vec<(String, &T)> {
    let mut out = Vec::new();
    if let Some(v) = &self.eq {
      out.push(("eq".to_owned(), v));
    }
    if let Some(v) = &self.not_eq {
      out.push(("notEq".to_owned(), v));
    }
    for (name, list) in [("in", &self.r#in), ("notIn", &self.not_in)] {
      if let Some(list) = list {
        out.extend(list.iter().enumerate().map(|(i, v)| (format!("{name}[{i}]"), v)));
      }
    }
    out
  }
}

/// Time-period operators: membership plus ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeComparison {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub eq:     Option<TimePeriod>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub not_eq: Option<TimePeriod>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub r#in:   Option<Vec<TimePeriod>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub not_in: Option<Vec<TimePeriod>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gt:     Option<TimePeriod>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gte:    Option<TimePeriod>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lt:     Option<TimePeriod>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lte:    Option<TimePeriod>,
}

impl TimeComparison {
  pub fn between(start: TimePeriod, end: TimePeriod) -> Self {
    Self { gte: Some(start), lte: Some(end), ..Self::default() }
  }

  pub fn is_empty(&self) -> bool {
    self.eq.is_none()
      && self.not_eq.is_none()
      && self.r#in.is_none()
      && self.not_in.is_none()
      && self.gt.is_none()
      && self.gte.is_none()
      && self.lt.is_none()
      && self.lte.is_none()
  }
}

// ─── Tree ────────────────────────────────────────────────────────────────────

/// A leaf: constraints on the facets of one observation, all of which must
/// hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Criteria {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub filters:           Option<Comparison<Uuid>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub locations:         Option<Comparison<Uuid>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub geographic_levels: Option<Comparison<GeographicLevel>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub time_periods:      Option<TimeComparison>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawFacetNode", into = "RawFacetNode")]
pub enum FacetNode {
  And(Vec<FacetNode>),
  Or(Vec<FacetNode>),
  Not(Box<FacetNode>),
  Criteria(Criteria),
}

impl Default for FacetNode {
  fn default() -> Self { Self::Criteria(Criteria::default()) }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AndNode {
  and: Vec<FacetNode>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrNode {
  or: Vec<FacetNode>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct NotNode {
  not: Box<FacetNode>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WrappedCriteria {
  criteria: Criteria,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawFacetNode {
  And(AndNode),
  Or(OrNode),
  Not(NotNode),
  Wrapped(WrappedCriteria),
  Criteria(Criteria),
}

impl From<RawFacetNode> for FacetNode {
  fn from(raw: RawFacetNode) -> Self {
    match raw {
      RawFacetNode::And(n) => Self::And(n.and),
      RawFacetNode::Or(n) => Self::Or(n.or),
      RawFacetNode::Not(n) => Self::Not(n.not),
      RawFacetNode::Wrapped(w) => Self::Criteria(w.criteria),
      RawFacetNode::Criteria(c) => Self::Criteria(c),
    }
  }
}

impl From<FacetNode> for RawFacetNode {
  fn from(node: FacetNode) -> Self {
    match node {
      FacetNode::And(and) => Self::And(AndNode { and }),
      FacetNode::Or(or) => Self::Or(OrNode { or }),
      FacetNode::Not(not) => Self::Not(NotNode { not }),
      FacetNode::Criteria(c) => Self::Criteria(c),
    }
  }
}

// ─── Query errors ────────────────────────────────────────────────────────────

/// A field-level problem with a query. Queries with any error are rejected
/// whole; no partial results are returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
  pub field:   String,
  pub message: String,
}

impl QueryError {
  pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
    Self { field: field.into(), message: message.into() }
  }
}

impl FacetNode {
  /// Check structure and that every referenced id belongs to `meta`.
  pub fn validate(&self, meta: &SubjectMeta, path: &str, errors: &mut Vec<QueryError>) {
    self.validate_at(meta, path, 0, errors);
  }

  fn validate_at(
    &self,
    meta: &SubjectMeta,
    path: &str,
    depth: usize,
    errors: &mut Vec<QueryError>,
  ) {
    if depth > MAX_DEPTH {
      errors.push(QueryError::new(path, format!("nesting deeper than {MAX_DEPTH}")));
      return;
    }
    match self {
      Self::And(children) | Self::Or(children) => {
        let op = if matches!(self, Self::And(_)) { "and" } else { "or" };
        if children.is_empty() {
          errors.push(QueryError::new(format!("{path}.{op}"), "must not be empty"));
        }
        for (i, child) in children.iter().enumerate() {
          child.validate_at(meta, &format!("{path}.{op}[{i}]"), depth + 1, errors);
        }
      }
      Self::Not(child) => child.validate_at(meta, &format!("{path}.not"), depth + 1, errors),
      Self::Criteria(c) => c.validate(meta, path, errors),
    }
  }

  /// Filter items referenced anywhere in the tree (used to attach footnotes).
  pub fn filter_items(&self) -> Vec<Uuid> {
    let mut out = Vec::new();
    self.collect_filter_items(&mut out);
    out.sort();
    out.dedup();
    out
  }

  fn collect_filter_items(&self, out: &mut Vec<Uuid>) {
    match self {
      Self::And(children) | Self::Or(children) => {
        children.iter().for_each(|c| c.collect_filter_items(out));
      }
      Self::Not(child) => child.collect_filter_items(out),
      Self::Criteria(c) => {
        if let Some(f) = &c.filters {
          out.extend(f.values().into_iter().map(|(_, id)| *id));
        }
      }
    }
  }
}

fn check_membership<T>(
  cmp: &Comparison<T>,
  path: &str,
  errors: &mut Vec<QueryError>,
) {
  if cmp.is_empty() {
    errors.push(QueryError::new(path, "no comparison operator given"));
  }
  for (name, list) in [("in", &cmp.r#in), ("notIn", &cmp.not_in)] {
    if list.as_ref().is_some_and(|l| l.is_empty()) {
      errors.push(QueryError::new(format!("{path}.{name}"), "must not be empty"));
    }
  }
}

impl Criteria {
  fn validate(&self, meta: &SubjectMeta, path: &str, errors: &mut Vec<QueryError>) {
    if let Some(filters) = &self.filters {
      let base = format!("{path}.filters");
      check_membership(filters, &base, errors);
      for (suffix, id) in filters.values() {
        if meta.filter_item(*id).is_none() {
          errors.push(QueryError::new(format!("{base}.{suffix}"), format!("unknown filter item {id}")));
        }
      }
    }
    if let Some(locations) = &self.locations {
      let base = format!("{path}.locations");
      check_membership(locations, &base, errors);
      for (suffix, id) in locations.values() {
        if meta.location(*id).is_none() {
          errors.push(QueryError::new(format!("{base}.{suffix}"), format!("unknown location {id}")));
        }
      }
    }
    if let Some(levels) = &self.geographic_levels {
      check_membership(levels, &format!("{path}.geographicLevels"), errors);
    }
    if let Some(times) = &self.time_periods {
      let base = format!("{path}.timePeriods");
      if times.is_empty() {
        errors.push(QueryError::new(&base, "no comparison operator given"));
      }
      for (name, list) in [("in", &times.r#in), ("notIn", &times.not_in)] {
        if list.as_ref().is_some_and(|l| l.is_empty()) {
          errors.push(QueryError::new(format!("{base}.{name}"), "must not be empty"));
        }
      }
    }
  }
}

// ─── Sorting & paging ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SortField {
  TimePeriod,
  GeographicLevel,
  Location,
  Indicator(Uuid),
}

impl TryFrom<String> for SortField {
  type Error = String;

  fn try_from(s: String) -> Result<Self, String> {
    match s.as_str() {
      "timePeriod" => Ok(Self::TimePeriod),
      "geographicLevel" => Ok(Self::GeographicLevel),
      "location" => Ok(Self::Location),
      other => Uuid::parse_str(other)
        .map(Self::Indicator)
        .map_err(|_| format!("unknown sort field {other:?}")),
    }
  }
}

impl From<SortField> for String {
  fn from(f: SortField) -> Self {
    match f {
      SortField::TimePeriod => "timePeriod".into(),
      SortField::GeographicLevel => "geographicLevel".into(),
      SortField::Location => "location".into(),
      SortField::Indicator(id) => id.to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
  #[default]
  Asc,
  Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
  pub field:     SortField,
  #[serde(default)]
  pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paging {
  pub page:          u32,
  pub page_size:     u32,
  pub total_results: u64,
  pub total_pages:   u64,
}

impl Paging {
  pub fn new(page: u32, page_size: u32, total_results: u64) -> Self {
    let total_pages = total_results.div_ceil(u64::from(page_size.max(1)));
    Self { page, page_size, total_results, total_pages }
  }
}

// ─── Request shapes ──────────────────────────────────────────────────────────

/// Body of the faceted data-set query endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DataSetQuery {
  #[serde(default)]
  pub facets:     FacetNode,
  /// Indicators to project. Empty selects every indicator of the subject.
  #[serde(default)]
  pub indicators: Vec<Uuid>,
  #[serde(default)]
  pub sort:       Vec<SortSpec>,
}

/// A validated query as handed to a store.
#[derive(Debug, Clone)]
pub struct ObservationQuery {
  pub subject_id: Uuid,
  pub facets:     FacetNode,
  pub indicators: Vec<Uuid>,
  pub sort:       Vec<SortSpec>,
  pub page:       u32,
  pub page_size:  u32,
}

impl DataSetQuery {
  /// Validate against the subject's meta and page bounds, producing the
  /// store-level query.
  pub fn compile(
    self,
    meta: &SubjectMeta,
    page: u32,
    page_size: u32,
    max_page_size: u32,
  ) -> Result<ObservationQuery, Vec<QueryError>> {
    let mut errors = Vec::new();
    self.facets.validate(meta, "facets", &mut errors);
    for (i, id) in self.indicators.iter().enumerate() {
      if meta.indicator(*id).is_none() {
        errors.push(QueryError::new(format!("indicators[{i}]"), format!("unknown indicator {id}")));
      }
    }
    for (i, spec) in self.sort.iter().enumerate() {
      if let SortField::Indicator(id) = spec.field
        && meta.indicator(id).is_none()
      {
        errors.push(QueryError::new(format!("sort[{i}].field"), format!("unknown indicator {id}")));
      }
    }
    if page == 0 {
      errors.push(QueryError::new("page", "must be at least 1"));
    }
    if page_size == 0 || page_size > max_page_size {
      errors.push(QueryError::new("pageSize", format!("must be between 1 and {max_page_size}")));
    }
    if !errors.is_empty() {
      return Err(errors);
    }

    let indicators = if self.indicators.is_empty() {
      meta.indicators.iter().map(|i| i.indicator_id).collect()
    } else {
      self.indicators
    };

    Ok(ObservationQuery {
      subject_id: meta.subject.subject_id,
      facets: self.facets,
      indicators,
      sort: self.sort,
      page,
      page_size,
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePeriodRange {
  pub start: TimePeriod,
  pub end:   TimePeriod,
}

/// Body of the table-builder endpoint: flat selections rather than a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableBuilderQuery {
  pub subject_id:        Uuid,
  #[serde(default)]
  pub filters:           Vec<Uuid>,
  #[serde(default)]
  pub locations:         Vec<Uuid>,
  #[serde(default)]
  pub geographic_levels: Vec<GeographicLevel>,
  pub time_period:       Option<TimePeriodRange>,
  #[serde(default)]
  pub indicators:        Vec<Uuid>,
}

impl TableBuilderQuery {
  /// Build the equivalent facet tree. Items of the same filter are OR-ed;
  /// different filters, locations, levels and the time range are AND-ed.
  pub fn into_data_set_query(self, meta: &SubjectMeta) -> DataSetQuery {
    let mut by_filter: BTreeMap<Option<Uuid>, Vec<Uuid>> = BTreeMap::new();
    for id in self.filters {
      let owner = meta.filter_item(id).map(|(f, _)| f.filter.filter_id);
      by_filter.entry(owner).or_default().push(id);
    }

    let mut clauses: Vec<FacetNode> = by_filter
      .into_values()
      .map(|items| {
        FacetNode::Criteria(Criteria {
          filters: Some(Comparison::any_of(items)),
          ..Criteria::default()
        })
      })
      .collect();

    if !self.locations.is_empty() {
      clauses.push(FacetNode::Criteria(Criteria {
        locations: Some(Comparison::any_of(self.locations)),
        ..Criteria::default()
      }));
    }
    if !self.geographic_levels.is_empty() {
      clauses.push(FacetNode::Criteria(Criteria {
        geographic_levels: Some(Comparison::any_of(self.geographic_levels)),
        ..Criteria::default()
      }));
    }
    if let Some(range) = self.time_period {
      clauses.push(FacetNode::Criteria(Criteria {
        time_periods: Some(TimeComparison::between(range.start, range.end)),
        ..Criteria::default()
      }));
    }

    let facets = match clauses.len() {
      0 => FacetNode::default(),
      1 => clauses.remove(0),
      _ => FacetNode::And(clauses),
    };

    DataSetQuery { facets, indicators: self.indicators, sort: Vec::new() }
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use serde_json::json;

  use super::*;
  use crate::{
    dimension::{Filter, FilterGroup, FilterGroupMeta, FilterItem, FilterMeta, Subject},
    time::TimeIdentifier,
  };

  fn meta_with_items(items: &[Uuid]) -> SubjectMeta {
    let subject_id = Uuid::new_v4();
    let filter_id = Uuid::new_v4();
    let group_id = Uuid::new_v4();
    SubjectMeta {
      subject: Subject {
        subject_id,
        release_id: Uuid::new_v4(),
        name: "absence".into(),
        created_at: Utc::now(),
      },
      filters: vec![FilterMeta {
        filter: Filter {
          filter_id,
          subject_id,
          name: "school_type".into(),
          label: "School type".into(),
          hint: None,
          grouping_column: None,
        },
        groups: vec![FilterGroupMeta {
          group: FilterGroup { filter_group_id: group_id, filter_id, label: "Default".into() },
          items: items
            .iter()
            .map(|id| FilterItem {
              filter_item_id: *id,
              filter_group_id: group_id,
              label: id.to_string(),
            })
            .collect(),
        }],
      }],
      indicator_groups: vec![],
      indicators: vec![],
      locations: vec![],
      time_periods: vec![],
      geographic_levels: vec![],
    }
  }

  #[test]
  fn parses_boolean_tree() {
    let f1 = Uuid::new_v4();
    let node: FacetNode = serde_json::from_value(json!({
      "and": [
        { "filters": { "in": [f1] } },
        { "timePeriods": { "gte": { "year": 2020, "code": "AY" } } }
      ]
    }))
    .unwrap();

    let FacetNode::And(children) = node else { panic!("expected and") };
    assert_eq!(children.len(), 2);
    assert!(matches!(
      &children[1],
      FacetNode::Criteria(Criteria { time_periods: Some(t), .. })
        if t.gte == Some(TimePeriod::new(2020, TimeIdentifier::AcademicYear))
    ));
  }

  #[test]
  fn parses_wrapped_criteria_and_not() {
    let node: FacetNode = serde_json::from_value(json!({
      "not": { "criteria": { "geographicLevels": { "eq": "Region" } } }
    }))
    .unwrap();
    let FacetNode::Not(inner) = node else { panic!("expected not") };
    assert!(matches!(*inner, FacetNode::Criteria(Criteria { geographic_levels: Some(_), .. })));
  }

  #[test]
  fn comparison_writes_only_present_operators() {
    let cmp = Comparison { not_in: Some(vec![GeographicLevel::Region]), ..Comparison::default() };
    let value = serde_json::to_value(&cmp).unwrap();
    assert_eq!(value, json!({ "notIn": ["Region"] }));
    assert_eq!(serde_json::from_value::<Comparison<GeographicLevel>>(value).unwrap(), cmp);
  }

  #[test]
  fn empty_object_matches_everything() {
    let node: FacetNode = serde_json::from_value(json!({})).unwrap();
    assert_eq!(node, FacetNode::default());
  }

  #[test]
  fn unknown_keys_are_rejected() {
    assert!(serde_json::from_value::<FacetNode>(json!({ "andd": [] })).is_err());
    assert!(
      serde_json::from_value::<FacetNode>(json!({ "filters": { "like": [] } })).is_err()
    );
  }

  #[test]
  fn validation_reports_field_paths() {
    let known = Uuid::new_v4();
    let unknown = Uuid::new_v4();
    let meta = meta_with_items(&[known]);
    let node: FacetNode = serde_json::from_value(json!({
      "or": [
        { "filters": { "in": [known, unknown] } },
        { "locations": {} },
        { "and": [] }
      ]
    }))
    .unwrap();

    let mut errors = Vec::new();
    node.validate(&meta, "facets", &mut errors);
    let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
    assert_eq!(
      fields,
      vec!["facets.or[0].filters.in[1]", "facets.or[1].locations", "facets.or[2].and"]
    );
  }

  #[test]
  fn compile_rejects_bad_paging_and_defaults_indicators() {
    let meta = meta_with_items(&[]);
    let errs = DataSetQuery::default().compile(&meta, 0, 50_000, 10_000).unwrap_err();
    assert_eq!(errs.len(), 2);

    let ok = DataSetQuery::default().compile(&meta, 1, 100, 10_000).unwrap();
    assert!(ok.indicators.is_empty());
    assert_eq!(ok.subject_id, meta.subject.subject_id);
  }

  #[test]
  fn table_builder_groups_items_by_filter() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let meta = meta_with_items(&[a, b]);
    let query = TableBuilderQuery {
      subject_id:        meta.subject.subject_id,
      filters:           vec![a, b],
      locations:         vec![],
      geographic_levels: vec![GeographicLevel::Country],
      time_period:       None,
      indicators:        vec![],
    };
    let FacetNode::And(clauses) = query.into_data_set_query(&meta).facets else {
      panic!("expected and")
    };
    assert_eq!(clauses.len(), 2);
    assert!(matches!(
      &clauses[0],
      FacetNode::Criteria(Criteria { filters: Some(c), .. }) if c.r#in.as_deref() == Some(&[a, b][..])
    ));
  }

  #[test]
  fn paging_rounds_up() {
    let p = Paging::new(1, 10, 21);
    assert_eq!(p.total_pages, 3);
    assert_eq!(Paging::new(1, 10, 0).total_pages, 0);
  }
}
