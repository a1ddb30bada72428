//! Time identifiers and time periods.
//!
//! A time period is a `(year, identifier)` pair. Identifiers that describe a
//! span across two calendar years (academic, financial and tax years and
//! their parts) are written as six digits in source files (`201819`) and
//! stored by their starting year (`2018`).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The kind of period a row's `time_period` value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeIdentifier {
  AcademicYear,
  AcademicYearQ(u8),
  CalendarYear,
  CalendarYearQ(u8),
  FinancialYear,
  FinancialYearQ(u8),
  TaxYear,
  TaxYearQ(u8),
  ReportingYear,
  AutumnTerm,
  AutumnSpringTerm,
  SpringTerm,
  SummerTerm,
  /// Calendar month, 1..=12.
  Month(u8),
  /// Week number, 1..=53.
  Week(u8),
}

const MONTHS: [&str; 12] = [
  "January", "February", "March", "April", "May", "June", "July", "August",
  "September", "October", "November", "December",
];

impl TimeIdentifier {
  /// Short code used in queries and exports, e.g. `AY`, `CYQ2`, `M11`.
  pub fn code(&self) -> String {
    match self {
      Self::AcademicYear => "AY".into(),
      Self::AcademicYearQ(q) => format!("AYQ{q}"),
      Self::CalendarYear => "CY".into(),
      Self::CalendarYearQ(q) => format!("CYQ{q}"),
      Self::FinancialYear => "FY".into(),
      Self::FinancialYearQ(q) => format!("FYQ{q}"),
      Self::TaxYear => "TY".into(),
      Self::TaxYearQ(q) => format!("TYQ{q}"),
      Self::ReportingYear => "RY".into(),
      Self::AutumnTerm => "T1".into(),
      Self::AutumnSpringTerm => "T1T2".into(),
      Self::SpringTerm => "T2".into(),
      Self::SummerTerm => "T3".into(),
      Self::Month(m) => format!("M{m}"),
      Self::Week(w) => format!("W{w}"),
    }
  }

  /// Human label as it appears in the `time_identifier` column of data files.
  pub fn label(&self) -> String {
    match self {
      Self::AcademicYear => "Academic year".into(),
      Self::AcademicYearQ(q) => format!("Academic year Q{q}"),
      Self::CalendarYear => "Calendar year".into(),
      Self::CalendarYearQ(q) => format!("Calendar year Q{q}"),
      Self::FinancialYear => "Financial year".into(),
      Self::FinancialYearQ(q) => format!("Financial year Q{q}"),
      Self::TaxYear => "Tax year".into(),
      Self::TaxYearQ(q) => format!("Tax year Q{q}"),
      Self::ReportingYear => "Reporting year".into(),
      Self::AutumnTerm => "Autumn term".into(),
      Self::AutumnSpringTerm => "Autumn and spring term".into(),
      Self::SpringTerm => "Spring term".into(),
      Self::SummerTerm => "Summer term".into(),
      Self::Month(m) => MONTHS[usize::from(*m - 1)].into(),
      Self::Week(w) => format!("Week {w}"),
    }
  }

  /// Parse a short code (`AY`, `FYQ3`, `M4`, `W12`). Case-insensitive.
  pub fn from_code(code: &str) -> Result<Self> {
    let upper = code.trim().to_ascii_uppercase();
    let parsed = match upper.as_str() {
      "AY" => Some(Self::AcademicYear),
      "CY" => Some(Self::CalendarYear),
      "FY" => Some(Self::FinancialYear),
      "TY" => Some(Self::TaxYear),
      "RY" => Some(Self::ReportingYear),
      "T1" => Some(Self::AutumnTerm),
      "T1T2" => Some(Self::AutumnSpringTerm),
      "T2" => Some(Self::SpringTerm),
      "T3" => Some(Self::SummerTerm),
      other => parse_numbered_code(other),
    };
    parsed.ok_or_else(|| Error::UnknownTimeIdentifier(code.to_owned()))
  }

  /// Parse a data-file label (`Academic year`, `Calendar year Q1`, `March`,
  /// `Week 7`). Case-insensitive; short codes are accepted too.
  pub fn from_label(label: &str) -> Result<Self> {
    let lower = label.trim().to_ascii_lowercase();
    let fixed = match lower.as_str() {
      "academic year" => Some(Self::AcademicYear),
      "calendar year" => Some(Self::CalendarYear),
      "financial year" => Some(Self::FinancialYear),
      "tax year" => Some(Self::TaxYear),
      "reporting year" => Some(Self::ReportingYear),
      "autumn term" => Some(Self::AutumnTerm),
      "autumn and spring term" => Some(Self::AutumnSpringTerm),
      "spring term" => Some(Self::SpringTerm),
      "summer term" => Some(Self::SummerTerm),
      _ => None,
    };
    if let Some(id) = fixed {
      return Ok(id);
    }

    if let Some(idx) = MONTHS.iter().position(|m| m.eq_ignore_ascii_case(&lower)) {
      return Ok(Self::Month(idx as u8 + 1));
    }

    if let Some(rest) = lower.strip_prefix("week ")
      && let Ok(w) = rest.trim().parse::<u8>()
      && (1..=53).contains(&w)
    {
      return Ok(Self::Week(w));
    }

    for (prefix, ctor) in [
      ("academic year q", Self::AcademicYearQ as fn(u8) -> Self),
      ("calendar year q", Self::CalendarYearQ),
      ("financial year q", Self::FinancialYearQ),
      ("tax year q", Self::TaxYearQ),
    ] {
      if let Some(rest) = lower.strip_prefix(prefix)
        && let Ok(q) = rest.trim().parse::<u8>()
        && (1..=4).contains(&q)
      {
        return Ok(ctor(q));
      }
    }

    Self::from_code(label).map_err(|_| Error::UnknownTimeIdentifier(label.to_owned()))
  }

  /// Whether a period with this identifier spans two calendar years.
  pub fn is_span(&self) -> bool {
    matches!(
      self,
      Self::AcademicYear
        | Self::AcademicYearQ(_)
        | Self::FinancialYear
        | Self::FinancialYearQ(_)
        | Self::TaxYear
        | Self::TaxYearQ(_)
        | Self::AutumnTerm
        | Self::AutumnSpringTerm
        | Self::SpringTerm
        | Self::SummerTerm
    )
  }

  /// Sort key of this identifier within a single year.
  pub fn ordinal(&self) -> i64 {
    match self {
      Self::AcademicYear => 0,
      Self::AcademicYearQ(q) => i64::from(*q),
      Self::CalendarYear => 10,
      Self::CalendarYearQ(q) => 10 + i64::from(*q),
      Self::FinancialYear => 20,
      Self::FinancialYearQ(q) => 20 + i64::from(*q),
      Self::TaxYear => 30,
      Self::TaxYearQ(q) => 30 + i64::from(*q),
      Self::ReportingYear => 40,
      Self::AutumnTerm => 50,
      Self::AutumnSpringTerm => 51,
      Self::SpringTerm => 52,
      Self::SummerTerm => 53,
      Self::Month(m) => 100 + i64::from(*m),
      Self::Week(w) => 200 + i64::from(*w),
    }
  }
}

fn parse_numbered_code(code: &str) -> Option<TimeIdentifier> {
  let quarter = |rest: &str, ctor: fn(u8) -> TimeIdentifier| {
    rest.parse::<u8>().ok().filter(|q| (1..=4).contains(q)).map(ctor)
  };
  if let Some(rest) = code.strip_prefix("AYQ") {
    return quarter(rest, TimeIdentifier::AcademicYearQ);
  }
  if let Some(rest) = code.strip_prefix("CYQ") {
    return quarter(rest, TimeIdentifier::CalendarYearQ);
  }
  if let Some(rest) = code.strip_prefix("FYQ") {
    return quarter(rest, TimeIdentifier::FinancialYearQ);
  }
  if let Some(rest) = code.strip_prefix("TYQ") {
    return quarter(rest, TimeIdentifier::TaxYearQ);
  }
  if let Some(rest) = code.strip_prefix('M') {
    return rest.parse::<u8>().ok().filter(|m| (1..=12).contains(m)).map(TimeIdentifier::Month);
  }
  if let Some(rest) = code.strip_prefix('W') {
    return rest.parse::<u8>().ok().filter(|w| (1..=53).contains(w)).map(TimeIdentifier::Week);
  }
  None
}

impl fmt::Display for TimeIdentifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.code()) }
}

impl FromStr for TimeIdentifier {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> { Self::from_code(s) }
}

impl TryFrom<String> for TimeIdentifier {
  type Error = Error;

  fn try_from(s: String) -> Result<Self> { Self::from_code(&s) }
}

impl From<TimeIdentifier> for String {
  fn from(id: TimeIdentifier) -> Self { id.code() }
}

// ─── TimePeriod ──────────────────────────────────────────────────────────────

/// A concrete period: `{ "year": 2018, "code": "AY" }` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimePeriod {
  pub year:       i32,
  #[serde(rename = "code")]
  pub identifier: TimeIdentifier,
}

impl TimePeriod {
  pub fn new(year: i32, identifier: TimeIdentifier) -> Self { Self { year, identifier } }

  /// Parse the `time_period` column of a data file against its identifier.
  ///
  /// Span identifiers require six digits whose second half is the following
  /// year (`201819`); all others require a four-digit year.
  pub fn parse(period: &str, identifier: TimeIdentifier) -> Result<Self> {
    let invalid = || Error::InvalidTimePeriod {
      period:     period.to_owned(),
      identifier: identifier.label(),
    };
    let period = period.trim();
    if !period.bytes().all(|b| b.is_ascii_digit()) {
      return Err(invalid());
    }

    match (identifier.is_span(), period.len()) {
      (true, 6) => {
        let start: i32 = period[..4].parse().map_err(|_| invalid())?;
        let end: i32 = period[4..].parse().map_err(|_| invalid())?;
        if (start + 1) % 100 != end {
          return Err(invalid());
        }
        Ok(Self::new(start, identifier))
      }
      (false, 4) => {
        let year: i32 = period.parse().map_err(|_| invalid())?;
        Ok(Self::new(year, identifier))
      }
      _ => Err(invalid()),
    }
  }

  /// The period as written in a data file: `201819` or `2018`.
  pub fn format_period(&self) -> String {
    if self.identifier.is_span() {
      format!("{}{:02}", self.year, (self.year + 1).rem_euclid(100))
    } else {
      self.year.to_string()
    }
  }

  /// Human label, e.g. `2018/19 Autumn term` or `2020 March`.
  pub fn label(&self) -> String {
    let year = if self.identifier.is_span() {
      format!("{}/{:02}", self.year, (self.year + 1).rem_euclid(100))
    } else {
      self.year.to_string()
    };
    match self.identifier {
      TimeIdentifier::AcademicYear | TimeIdentifier::CalendarYear => year,
      other => format!("{year} {}", other.label()),
    }
  }

  /// Total-order key used for range comparisons.
  pub fn sort_key(&self) -> (i32, i64) { (self.year, self.identifier.ordinal()) }
}

impl PartialOrd for TimePeriod {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for TimePeriod {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.sort_key().cmp(&other.sort_key()) }
}
