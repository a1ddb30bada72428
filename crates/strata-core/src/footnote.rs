//! Footnotes: annotations scoped to part of a subject's data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One element of a footnote's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum FootnoteScope {
  Subject(Uuid),
  Filter(Uuid),
  FilterGroup(Uuid),
  FilterItem(Uuid),
  Indicator(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Footnote {
  pub footnote_id: Uuid,
  pub content:     String,
  pub scopes:      Vec<FootnoteScope>,
  pub created_at:  DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFootnote {
  pub content: String,
  pub scopes:  Vec<FootnoteScope>,
}

/// The parts of a query a footnote may be attached to.
///
/// A footnote applies when any of its scopes names the subject, or one of the
/// selected filters, filter groups, filter items or indicators.
#[derive(Debug, Clone, Default)]
pub struct FootnoteTarget {
  pub subject_id:    Uuid,
  pub filters:       Vec<Uuid>,
  pub filter_groups: Vec<Uuid>,
  pub filter_items:  Vec<Uuid>,
  pub indicators:    Vec<Uuid>,
}

impl FootnoteTarget {
  pub fn matches(&self, scope: &FootnoteScope) -> bool {
    match scope {
      FootnoteScope::Subject(id) => *id == self.subject_id,
      FootnoteScope::Filter(id) => self.filters.contains(id),
      FootnoteScope::FilterGroup(id) => self.filter_groups.contains(id),
      FootnoteScope::FilterItem(id) => self.filter_items.contains(id),
      FootnoteScope::Indicator(id) => self.indicators.contains(id),
    }
  }
}
