//! Compilation of a [`FacetNode`] tree into a SQL predicate over
//! `observations o`.
//!
//! Filter constraints become `EXISTS` probes into `observation_filter_items`;
//! location, level and time constraints compare indexed observation columns.
//! Time ordering compares the `(year, time_order)` row value, so `gte` on
//! `2020 AY` admits every later year and every later identifier in 2020.

use rusqlite::types::Value;
use strata_core::{
  query::{Comparison, Criteria, FacetNode, SortDirection, SortField, SortSpec, TimeComparison},
  time::TimePeriod,
};
use uuid::Uuid;

use crate::encode::{encode_level, encode_uuid, measure_path};

/// A SQL fragment and the positional parameters it binds, in order.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
  pub sql:    String,
  pub params: Vec<Value>,
}

impl Fragment {
  fn new(sql: impl Into<String>) -> Self { Self { sql: sql.into(), params: Vec::new() } }

  fn with(sql: impl Into<String>, params: Vec<Value>) -> Self {
    Self { sql: sql.into(), params }
  }
}

const TRUE: &str = "1";
const FALSE: &str = "0";

fn placeholders(n: usize) -> String { vec!["?"; n].join(", ") }

fn text(s: String) -> Value { Value::Text(s) }

/// Join fragments with `op`, parenthesised. An empty list yields `empty`.
fn join(parts: Vec<Fragment>, op: &str, empty: &str) -> Fragment {
  if parts.is_empty() {
    return Fragment::new(empty);
  }
  let mut params = Vec::new();
  let sql = parts
    .into_iter()
    .map(|p| {
      params.extend(p.params);
      p.sql
    })
    .collect::<Vec<_>>()
    .join(&format!(" {op} "));
  Fragment::with(format!("({sql})"), params)
}

fn negate(f: Fragment) -> Fragment { Fragment::with(format!("NOT ({})", f.sql), f.params) }

/// Compile the whole tree.
pub fn compile(node: &FacetNode) -> Fragment {
  match node {
    FacetNode::And(children) => join(children.iter().map(compile).collect(), "AND", TRUE),
    FacetNode::Or(children) => join(children.iter().map(compile).collect(), "OR", FALSE),
    FacetNode::Not(child) => negate(compile(child)),
    FacetNode::Criteria(c) => criteria(c),
  }
}

fn criteria(c: &Criteria) -> Fragment {
  let mut parts = Vec::new();
  if let Some(cmp) = &c.filters {
    parts.extend(filter_parts(cmp));
  }
  if let Some(cmp) = &c.locations {
    parts.extend(column_parts("o.location_id", cmp, |id| text(encode_uuid(*id))));
  }
  if let Some(cmp) = &c.geographic_levels {
    parts.extend(column_parts("o.geographic_level", cmp, |l| text(encode_level(*l))));
  }
  if let Some(cmp) = &c.time_periods {
    parts.extend(time_parts(cmp));
  }
  join(parts, "AND", TRUE)
}

// ─── Filters ─────────────────────────────────────────────────────────────────

fn has_item(ids: &[Uuid]) -> Fragment {
  Fragment::with(
    format!(
      "EXISTS (SELECT 1 FROM observation_filter_items f \
         WHERE f.observation_id = o.observation_id AND f.filter_item_id IN ({}))",
      placeholders(ids.len())
    ),
    ids.iter().map(|id| text(encode_uuid(*id))).collect(),
  )
}

fn filter_parts(cmp: &Comparison<Uuid>) -> Vec<Fragment> {
  let mut parts = Vec::new();
  if let Some(id) = &cmp.eq {
    parts.push(has_item(std::slice::from_ref(id)));
  }
  if let Some(id) = &cmp.not_eq {
    parts.push(negate(has_item(std::slice::from_ref(id))));
  }
  if let Some(ids) = &cmp.r#in {
    parts.push(if ids.is_empty() { Fragment::new(FALSE) } else { has_item(ids) });
  }
  if let Some(ids) = &cmp.not_in
    && !ids.is_empty()
  {
    parts.push(negate(has_item(ids)));
  }
  parts
}

// ─── Plain columns ───────────────────────────────────────────────────────────

fn column_parts<T>(column: &str, cmp: &Comparison<T>, bind: impl Fn(&T) -> Value) -> Vec<Fragment> {
  let mut parts = Vec::new();
  if let Some(v) = &cmp.eq {
    parts.push(Fragment::with(format!("{column} = ?"), vec![bind(v)]));
  }
  if let Some(v) = &cmp.not_eq {
    parts.push(Fragment::with(format!("{column} <> ?"), vec![bind(v)]));
  }
  if let Some(vs) = &cmp.r#in {
    parts.push(if vs.is_empty() {
      Fragment::new(FALSE)
    } else {
      Fragment::with(format!("{column} IN ({})", placeholders(vs.len())), vs.iter().map(&bind).collect())
    });
  }
  if let Some(vs) = &cmp.not_in
    && !vs.is_empty()
  {
    parts.push(Fragment::with(
      format!("{column} NOT IN ({})", placeholders(vs.len())),
      vs.iter().map(&bind).collect(),
    ));
  }
  parts
}

// ─── Time periods ────────────────────────────────────────────────────────────

fn period_params(p: &TimePeriod) -> Vec<Value> {
  vec![Value::Integer(i64::from(p.year)), text(p.identifier.code())]
}

fn period_eq(p: &TimePeriod) -> Fragment {
  Fragment::with("(o.year = ? AND o.time_identifier = ?)", period_params(p))
}

fn period_cmp(op: &str, p: &TimePeriod) -> Fragment {
  Fragment::with(
    format!("(o.year, o.time_order) {op} (?, ?)"),
    vec![Value::Integer(i64::from(p.year)), Value::Integer(p.identifier.ordinal())],
  )
}

fn time_parts(cmp: &TimeComparison) -> Vec<Fragment> {
  let mut parts = Vec::new();
  if let Some(p) = &cmp.eq {
    parts.push(period_eq(p));
  }
  if let Some(p) = &cmp.not_eq {
    parts.push(negate(period_eq(p)));
  }
  if let Some(ps) = &cmp.r#in {
    parts.push(join(ps.iter().map(period_eq).collect(), "OR", FALSE));
  }
  if let Some(ps) = &cmp.not_in
    && !ps.is_empty()
  {
    parts.push(negate(join(ps.iter().map(period_eq).collect(), "OR", FALSE)));
  }
  for (op, bound) in [(">", &cmp.gt), (">=", &cmp.gte), ("<", &cmp.lt), ("<=", &cmp.lte)] {
    if let Some(p) = bound {
      parts.push(period_cmp(op, p));
    }
  }
  parts
}

// ─── Ordering ────────────────────────────────────────────────────────────────

/// `ORDER BY` list for a paged query. Without explicit sort the newest
/// periods come first, then level, then location. The rowid is always the
/// final tiebreak so pages are stable.
pub fn order_by(sort: &[SortSpec]) -> Fragment {
  if sort.is_empty() {
    return Fragment::new(
      "o.year DESC, o.time_order DESC, o.geographic_level ASC, l.code ASC, o.rowid ASC",
    );
  }

  let mut terms = Vec::new();
  let mut params = Vec::new();
  for spec in sort {
    let dir = match spec.direction {
      SortDirection::Asc => "ASC",
      SortDirection::Desc => "DESC",
    };
    match &spec.field {
      SortField::TimePeriod => {
        terms.push(format!("o.year {dir}"));
        terms.push(format!("o.time_order {dir}"));
      }
      SortField::GeographicLevel => terms.push(format!("o.geographic_level {dir}")),
      SortField::Location => {
        terms.push(format!("l.name {dir}"));
        terms.push(format!("l.code {dir}"));
      }
      SortField::Indicator(id) => {
        terms.push(format!("CAST(json_extract(o.measures, ?) AS REAL) {dir}"));
        params.push(text(measure_path(*id)));
      }
    }
  }
  terms.push("o.rowid ASC".to_owned());
  Fragment::with(terms.join(", "), params)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn node(v: serde_json::Value) -> FacetNode { serde_json::from_value(v).unwrap() }

  #[test]
  fn empty_criteria_is_true() {
    let f = compile(&FacetNode::default());
    assert_eq!(f.sql, TRUE);
    assert!(f.params.is_empty());
  }

  #[test]
  fn and_of_filter_and_time() {
    let item = Uuid::new_v4();
    let f = compile(&node(json!({
      "and": [
        { "filters": { "in": [item] } },
        { "timePeriods": { "gte": { "year": 2020, "code": "AY" } } }
      ]
    })));
    assert!(f.sql.starts_with("((EXISTS"));
    assert!(f.sql.contains(" AND ((o.year, o.time_order) >= (?, ?))"));
    assert_eq!(f.params, vec![
      Value::Text(item.to_string()),
      Value::Integer(2020),
      Value::Integer(0),
    ]);
  }

  #[test]
  fn not_and_not_in_negate() {
    let f = compile(&node(json!({
      "not": { "geographicLevels": { "notIn": ["Country", "Region"] } }
    })));
    assert_eq!(f.sql, "NOT ((o.geographic_level NOT IN (?, ?)))");
    assert_eq!(f.params.len(), 2);
  }

  #[test]
  fn indicator_sort_binds_json_path() {
    let id = Uuid::new_v4();
    let f = order_by(&[SortSpec { field: SortField::Indicator(id), direction: SortDirection::Desc }]);
    assert_eq!(f.sql, "CAST(json_extract(o.measures, ?) AS REAL) DESC, o.rowid ASC");
    assert_eq!(f.params, vec![Value::Text(format!("$.\"{id}\""))]);
  }
}
