//! Dimension types: subjects, filters, indicators and locations.
//!
//! Dimension rows are shared reference data. Each has a natural key, and the
//! store holds at most one row per key: globally for locations, per subject
//! for filters and indicators. Rows are never mutated after creation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};
use uuid::Uuid;

use crate::{Error, Result, time::TimePeriod};

// ─── Geographic level ────────────────────────────────────────────────────────

/// The granularity of a [`Location`].
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  AsRefStr,
  EnumString,
  EnumIter,
  strum::Display,
)]
pub enum GeographicLevel {
  Country,
  Region,
  LocalAuthority,
  LocalAuthorityDistrict,
  ParliamentaryConstituency,
  Ward,
  School,
  Provider,
  Institution,
  MultiAcademyTrust,
  OpportunityArea,
  RscRegion,
  Sponsor,
  LocalEnterprisePartnership,
  EnglishDevolvedArea,
  PlanningArea,
}

/// Which columns of a data file identify a location at a given level.
#[derive(Debug, Clone, Copy)]
pub struct LocationColumns {
  /// Code columns in order of preference; the first non-empty one wins.
  pub code: &'static [&'static str],
  pub name: &'static str,
}

impl GeographicLevel {
  /// The value used in the `geographic_level` column of data files.
  pub fn label(&self) -> &'static str {
    match self {
      Self::Country => "National",
      Self::Region => "Regional",
      Self::LocalAuthority => "Local authority",
      Self::LocalAuthorityDistrict => "Local authority district",
      Self::ParliamentaryConstituency => "Parliamentary constituency",
      Self::Ward => "Ward",
      Self::School => "School",
      Self::Provider => "Provider",
      Self::Institution => "Institution",
      Self::MultiAcademyTrust => "MAT",
      Self::OpportunityArea => "Opportunity area",
      Self::RscRegion => "RSC region",
      Self::Sponsor => "Sponsor",
      Self::LocalEnterprisePartnership => "Local enterprise partnership",
      Self::EnglishDevolvedArea => "English devolved area",
      Self::PlanningArea => "Planning area",
    }
  }

  /// Parse a `geographic_level` cell. Case-insensitive; the enum variant name
  /// is accepted as well as the file label.
  pub fn from_label(label: &str) -> Result<Self> {
    use strum::IntoEnumIterator as _;
    let trimmed = label.trim();
    Self::iter()
      .find(|level| {
        level.label().eq_ignore_ascii_case(trimmed)
          || level.as_ref().eq_ignore_ascii_case(trimmed)
      })
      .ok_or_else(|| Error::UnknownGeographicLevel(label.to_owned()))
  }

  pub fn columns(&self) -> LocationColumns {
    let (code, name): (&'static [&'static str], &'static str) = match self {
      Self::Country => (&["country_code"], "country_name"),
      Self::Region => (&["region_code"], "region_name"),
      Self::LocalAuthority => (&["new_la_code", "old_la_code"], "la_name"),
      Self::LocalAuthorityDistrict => (&["lad_code"], "lad_name"),
      Self::ParliamentaryConstituency => (&["pcon_code"], "pcon_name"),
      Self::Ward => (&["ward_code"], "ward_name"),
      Self::School => (&["school_urn"], "school_name"),
      Self::Provider => (&["provider_ukprn"], "provider_name"),
      Self::Institution => (&["institution_id"], "institution_name"),
      Self::MultiAcademyTrust => (&["trust_id"], "trust_name"),
      Self::OpportunityArea => (&["opportunity_area_code"], "opportunity_area_name"),
      Self::RscRegion => (&["rsc_region_lead_name"], "rsc_region_lead_name"),
      Self::Sponsor => (&["sponsor_id"], "sponsor_name"),
      Self::LocalEnterprisePartnership => (
        &["local_enterprise_partnership_code"],
        "local_enterprise_partnership_name",
      ),
      Self::EnglishDevolvedArea => (&["english_devolved_area_code"], "english_devolved_area_name"),
      Self::PlanningArea => (&["planning_area_code"], "planning_area_name"),
    };
    LocationColumns { code, name }
  }

  /// Every column name that carries location data, across all levels.
  pub fn all_location_columns() -> BTreeSet<&'static str> {
    use strum::IntoEnumIterator as _;
    Self::iter()
      .flat_map(|level| {
        let cols = level.columns();
        cols.code.iter().copied().chain(std::iter::once(cols.name))
      })
      .collect()
  }
}

// ─── Subject ─────────────────────────────────────────────────────────────────

/// One statistical table within a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
  pub subject_id: Uuid,
  pub release_id: Uuid,
  pub name:       String,
  pub created_at: DateTime<Utc>,
}

// ─── Location ────────────────────────────────────────────────────────────────

/// A geographic entity. One shape for every level; `(level, code)` is the
/// natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
  pub location_id: Uuid,
  pub level:       GeographicLevel,
  pub code:        String,
  pub name:        String,
}

/// A location read from a data row, not yet resolved to a row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewLocation {
  pub level: GeographicLevel,
  pub code:  String,
  pub name:  String,
}

impl NewLocation {
  pub fn key(&self) -> LocationKey { (self.level, self.code.clone()) }
}

/// Natural key of a [`Location`].
pub type LocationKey = (GeographicLevel, String);

// ─── Filters ─────────────────────────────────────────────────────────────────

/// A categorical dimension of a subject, named after its data column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
  pub filter_id:       Uuid,
  pub subject_id:      Uuid,
  /// The data-file column holding this filter's item labels.
  pub name:            String,
  pub label:           String,
  pub hint:            Option<String>,
  /// Column whose values group this filter's items, if any.
  pub grouping_column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFilter {
  pub subject_id:      Uuid,
  pub name:            String,
  pub label:           String,
  pub hint:            Option<String>,
  pub grouping_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterGroup {
  pub filter_group_id: Uuid,
  pub filter_id:       Uuid,
  pub label:           String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterItem {
  pub filter_item_id:  Uuid,
  pub filter_group_id: Uuid,
  pub label:           String,
}

/// Label used for a filter's items when the filter has no grouping column.
pub const DEFAULT_GROUP: &str = "Default";

// ─── Indicators ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorGroup {
  pub indicator_group_id: Uuid,
  pub subject_id:         Uuid,
  pub label:              String,
}

/// A named numeric measure column of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Indicator {
  pub indicator_id:       Uuid,
  pub indicator_group_id: Uuid,
  pub subject_id:         Uuid,
  /// The data-file column holding this indicator's values.
  pub name:               String,
  pub label:              String,
  pub unit:               Option<String>,
  pub decimal_places:     Option<u8>,
}

#[derive(Debug, Clone)]
pub struct NewIndicator {
  pub subject_id:     Uuid,
  pub group_label:    String,
  pub name:           String,
  pub label:          String,
  pub unit:           Option<String>,
  pub decimal_places: Option<u8>,
}

// ─── Subject meta ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterGroupMeta {
  #[serde(flatten)]
  pub group: FilterGroup,
  pub items: Vec<FilterItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterMeta {
  #[serde(flatten)]
  pub filter: Filter,
  pub groups: Vec<FilterGroupMeta>,
}

impl FilterMeta {
  pub fn items(&self) -> impl Iterator<Item = &FilterItem> {
    self.groups.iter().flat_map(|g| g.items.iter())
  }
}

/// Everything a client needs to build a query against one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMeta {
  pub subject:           Subject,
  pub filters:           Vec<FilterMeta>,
  pub indicator_groups:  Vec<IndicatorGroup>,
  pub indicators:        Vec<Indicator>,
  /// Locations referenced by at least one of the subject's observations.
  pub locations:         Vec<Location>,
  pub time_periods:      Vec<TimePeriod>,
  pub geographic_levels: Vec<GeographicLevel>,
}

impl SubjectMeta {
  pub fn filter_item(&self, id: Uuid) -> Option<(&FilterMeta, &FilterItem)> {
    self
      .filters
      .iter()
      .find_map(|f| f.items().find(|i| i.filter_item_id == id).map(|i| (f, i)))
  }

  pub fn indicator(&self, id: Uuid) -> Option<&Indicator> {
    self.indicators.iter().find(|i| i.indicator_id == id)
  }

  pub fn location(&self, id: Uuid) -> Option<&Location> {
    self.locations.iter().find(|l| l.location_id == id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn level_labels_parse_both_ways() {
    assert_eq!(
      GeographicLevel::from_label("Local authority").unwrap(),
      GeographicLevel::LocalAuthority
    );
    assert_eq!(
      GeographicLevel::from_label("national").unwrap(),
      GeographicLevel::Country
    );
    assert_eq!(
      GeographicLevel::from_label("LocalAuthorityDistrict").unwrap(),
      GeographicLevel::LocalAuthorityDistrict
    );
    assert!(GeographicLevel::from_label("Galaxy").is_err());
  }

  #[test]
  fn location_columns_cover_la_fallback() {
    let cols = GeographicLevel::LocalAuthority.columns();
    assert_eq!(cols.code, &["new_la_code", "old_la_code"]);
    assert!(GeographicLevel::all_location_columns().contains("old_la_code"));
  }

  #[test]
  fn level_serializes_as_variant_name() {
    let json = serde_json::to_string(&GeographicLevel::LocalAuthority).unwrap();
    assert_eq!(json, "\"LocalAuthority\"");
    assert_eq!(GeographicLevel::LocalAuthority.as_ref(), "LocalAuthority");
  }
}
