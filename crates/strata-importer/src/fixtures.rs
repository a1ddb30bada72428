//! Seed data sets for tests, demos and the `seed` command.
//!
//! Every set is built on demand from its parameters; nothing here is global.

use std::{fmt::Write as _, path::Path};

use bytes::Bytes;
use uuid::Uuid;

use crate::coordinator::SubmitRequest;

/// A data file and its meta file, ready to submit.
#[derive(Debug, Clone)]
pub struct SeedSet {
  pub subject_name:   String,
  pub data_file_name: String,
  pub meta_file_name: String,
  pub data:           Bytes,
  pub meta:           Bytes,
}

const META_HEADER: &str = "col_name,col_type,label,indicator_grouping,indicator_unit,indicator_dp,filter_hint,filter_grouping_column\n";

impl SeedSet {
  /// Three national rows of pupil absence: one filter with two values and
  /// one indicator.
  pub fn absence() -> Self {
    let meta = format!(
      "{META_HEADER}\
       school_type,Filter,School type,,,,Type of school,\n\
       sess_overall_percent,Indicator,Overall absence rate,Absence fields,%,1,,\n"
    );
    let data = "\
time_period,time_identifier,geographic_level,country_code,country_name,school_type,sess_overall_percent
201617,Academic year,National,E92000001,England,State-funded primary,4.0
201617,Academic year,National,E92000001,England,State-funded secondary,5.4
201718,Academic year,National,E92000001,England,State-funded primary,c
";
    Self {
      subject_name:   "Pupil absence".to_owned(),
      data_file_name: "absence.csv".to_owned(),
      meta_file_name: "absence.meta.csv".to_owned(),
      data:           Bytes::from(data),
      meta:           Bytes::from(meta),
    }
  }

  /// `rows` deterministic rows across two levels, five academic years and a
  /// grouped filter. Every seventh value is suppressed.
  pub fn synthetic(rows: u64) -> Self {
    let meta = format!(
      "{META_HEADER}\
       school_type,Filter,School type,,,,,school_phase\n\
       enrolments,Indicator,Enrolments,,,0,,\n\
       fte_pupils,Indicator,FTE pupils,,,1,,\n"
    );

    let mut data = String::from(
      "time_period,time_identifier,geographic_level,country_code,country_name,region_code,region_name,school_phase,school_type,enrolments,fte_pupils\n",
    );
    for row in 1..=rows {
      let year = 2015 + row % 5;
      let (level, region_code, region_name) = if row % 3 == 0 {
        ("National", "", "")
      } else if row % 2 == 0 {
        ("Regional", "E12000001", "North East")
      } else {
        ("Regional", "E12000007", "London")
      };
      let (phase, school_type) = match row % 4 {
        0 => ("Primary", "Academy"),
        1 => ("Primary", "Maintained"),
        2 => ("Secondary", "Academy"),
        _ => ("Secondary", "Free school"),
      };
      let enrolments = if row % 7 == 0 { "c".to_owned() } else { (row * 10).to_string() };
      let _ = writeln!(
        data,
        "{year}{:02},Academic year,{level},E92000001,England,{region_code},{region_name},{phase},{school_type},{enrolments},{}.5",
        (year + 1) % 100,
        row * 9,
      );
    }

    Self {
      subject_name:   format!("Synthetic ({rows} rows)"),
      data_file_name: "synthetic.csv".to_owned(),
      meta_file_name: "synthetic.meta.csv".to_owned(),
      data:           Bytes::from(data),
      meta:           Bytes::from(meta),
    }
  }

  /// Load `{name}.csv` and `{name}.meta.csv` from `dir`.
  pub async fn from_dir(dir: &Path, name: &str) -> std::io::Result<Self> {
    let data_file_name = format!("{name}.csv");
    let meta_file_name = format!("{name}.meta.csv");
    let data = tokio::fs::read(dir.join(&data_file_name)).await?;
    let meta = tokio::fs::read(dir.join(&meta_file_name)).await?;
    Ok(Self {
      subject_name: name.to_owned(),
      data_file_name,
      meta_file_name,
      data: Bytes::from(data),
      meta: Bytes::from(meta),
    })
  }

  pub fn submit_request(&self, release_id: Uuid) -> SubmitRequest {
    SubmitRequest {
      release_id,
      subject_name: self.subject_name.clone(),
      data_file_name: self.data_file_name.clone(),
      meta_file_name: self.meta_file_name.clone(),
      data: self.data.clone(),
      meta: self.meta.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use strata_csv::{DataHeader, RowParser, count_rows, parse_meta};

  use super::*;

  fn parses_cleanly(set: &SeedSet) -> usize {
    let meta = parse_meta(&set.meta).unwrap();
    let parser = RowParser::new(DataHeader::read(&set.data).unwrap(), &meta).unwrap();
    let (rows, errors) = parser.parse_all(&set.data, true, 1).unwrap();
    assert!(errors.is_empty(), "{errors:?}");
    rows.len()
  }

  #[test]
  fn absence_is_valid() {
    assert_eq!(parses_cleanly(&SeedSet::absence()), 3);
  }

  #[test]
  fn synthetic_is_valid_and_deterministic() {
    let set = SeedSet::synthetic(50);
    assert_eq!(parses_cleanly(&set), 50);
    assert_eq!(count_rows(&set.data).unwrap(), 50);
    assert_eq!(set.data, SeedSet::synthetic(50).data);
  }

  #[tokio::test]
  async fn loads_from_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let absence = SeedSet::absence();
    std::fs::write(dir.path().join("absence.csv"), &absence.data).unwrap();
    std::fs::write(dir.path().join("absence.meta.csv"), &absence.meta).unwrap();

    let loaded = SeedSet::from_dir(dir.path(), "absence").await.unwrap();
    assert_eq!(loaded.data, absence.data);
    assert_eq!(loaded.meta_file_name, "absence.meta.csv");
  }
}
