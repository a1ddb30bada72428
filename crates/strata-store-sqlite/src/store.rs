//! [`SqliteStore`]: the SQLite implementation of [`StatStore`].

use std::{collections::BTreeSet, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior, params, params_from_iter, types::Value};
use strata_core::{
  dimension::{
    Filter, FilterGroup, FilterGroupMeta, FilterItem, FilterMeta, GeographicLevel, Indicator,
    Location, NewFilter, NewIndicator, NewLocation, Subject, SubjectMeta,
  },
  footnote::{Footnote, FootnoteTarget, NewFootnote},
  import::{
    FinalizeOutcome, ImportErrorEntry, ImportRecord, ImportStatus, ImportUpdate, NewImport,
    SubjectSummary,
  },
  observation::{BatchOutcome, ObservationBatch},
  query::ObservationQuery,
  store::{ObservationChunk, ObservationPage, StatStore},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{
    RawChild, RawFilter, RawFootnote, RawImport, RawIndicator, RawLocation, RawObservation,
    RawSubject, decode_level, decode_status, decode_time_period, encode_dt,
    encode_level, encode_measures, encode_scope, encode_uuid, non_negative,
  },
  query::{compile, order_by},
  schema::{CONNECTION_PRAGMAS, SCHEMA, SCHEMA_VERSION},
};

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Age after which a held `app_locks` row is taken over.
const LOCK_TTL: Duration = Duration::from_secs(600);

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn is_unique_violation(err: &rusqlite::Error) -> bool {
  matches!(
    err,
    rusqlite::Error::SqliteFailure(e, _)
      if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
  )
}

/// Select by natural key; on a miss, insert; if the insert loses a race to
/// another writer, re-read the winner's row.
fn get_or_insert<T, P>(
  conn: &rusqlite::Connection,
  select_sql: &str,
  key: P,
  read: impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
  insert: impl FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
) -> rusqlite::Result<T>
where
  P: rusqlite::Params + Copy,
{
  if let Some(found) = conn.query_row(select_sql, key, &read).optional()? {
    return Ok(found);
  }
  match insert(conn) {
    Ok(created) => Ok(created),
    Err(e) if is_unique_violation(&e) => conn.query_row(select_sql, key, &read),
    Err(e) => Err(e),
  }
}

fn encode_json<T: serde::Serialize + ?Sized>(v: &T) -> Result<String> { Ok(serde_json::to_string(v)?) }

const TERMINAL: &str = "('COMPLETE', 'FAILED', 'CANCELLED')";

/// Append `errors` to the JSON list stored on an import, inside `tx`.
fn append_errors(
  tx: &rusqlite::Transaction<'_>,
  id: &str,
  errors: &[String],
) -> rusqlite::Result<()> {
  for entry in errors {
    tx.execute(
      "UPDATE imports SET errors = json_insert(errors, '$[#]', json(?2)) WHERE import_id = ?1",
      params![id, entry],
    )?;
  }
  Ok(())
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A strata store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. Independent
/// `SqliteStore`s opened on the same file behave as independent processes.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store; useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let version: i64 = tx.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version < SCHEMA_VERSION {
          tx.execute_batch(SCHEMA)?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    debug!("schema ready");
    Ok(())
  }

  /// The database's `PRAGMA user_version`.
  pub async fn schema_version(&self) -> Result<i64> {
    let version: i64 = self
      .conn
      .call(|conn| Ok(conn.query_row("PRAGMA user_version", [], |r| r.get(0))?))
      .await?;
    Ok(version)
  }

  /// Take the named lock in its own committed transaction so every other
  /// connection sees it. A holder older than [`LOCK_TTL`] is presumed dead and
  /// replaced. Returns the holder's token, or `None` if the lock is taken.
  pub(crate) async fn try_lock(&self, name: &str) -> Result<Option<String>> {
    let name = name.to_owned();
    let now = Utc::now();
    let token = encode_dt(now);
    let acquired = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let held: Option<String> = tx
          .query_row("SELECT acquired_at FROM app_locks WHERE name = ?1", params![name], |r| r.get(0))
          .optional()?;
        if let Some(at) = held {
          // A timestamp ahead of this clock counts as live.
          let live = DateTime::parse_from_rfc3339(&at)
            .map(|at| {
              now
                .signed_duration_since(at.with_timezone(&Utc))
                .to_std()
                .map_or(true, |age| age < LOCK_TTL)
            })
            .unwrap_or(false);
          if live {
            return Ok(None);
          }
        }
        tx.execute(
          "INSERT INTO app_locks (name, acquired_at) VALUES (?1, ?2)
           ON CONFLICT (name) DO UPDATE SET acquired_at = excluded.acquired_at",
          params![name, token],
        )?;
        tx.commit()?;
        Ok(Some(token))
      })
      .await?;
    Ok(acquired)
  }

  /// Release a lock taken by [`Self::try_lock`], unless another holder has
  /// since replaced it.
  pub(crate) async fn unlock(&self, name: &str, token: String) -> Result<()> {
    let name = name.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM app_locks WHERE name = ?1 AND acquired_at = ?2",
          params![name, token],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// The finalize transaction proper, run while holding `finalize:{id}`.
  async fn finalize_locked(&self, record: &ImportRecord) -> Result<FinalizeOutcome> {
    let import_id = record.import_id;
    let id_str   = encode_uuid(import_id);
    let subject  = encode_uuid(record.subject_id);
    let now      = encode_dt(Utc::now());
    let finalize = ImportStatus::Finalize.as_ref().to_owned();
    let complete = ImportStatus::Complete.as_ref().to_owned();

    enum Step {
      NotInFinalize(String),
      Incomplete(u32, u32),
      RowMismatch(u64, u64),
      Done,
    }

    let step = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: String =
          tx.query_row("SELECT status FROM imports WHERE import_id = ?1", params![id_str], |r| r.get(0))?;
        if status != finalize {
          return Ok(Step::NotInFinalize(status));
        }

        let (completed, expected, imported_rows, total_rows): (u32, u32, i64, i64) = tx.query_row(
          "SELECT (SELECT COUNT(*) FROM import_batches WHERE import_id = ?1), num_batches,
                  imported_rows, total_rows
           FROM imports WHERE import_id = ?1",
          params![id_str],
          |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;
        if expected == 0 || completed < expected {
          return Ok(Step::Incomplete(completed, expected));
        }
        if imported_rows != total_rows {
          return Ok(Step::RowMismatch(non_negative(imported_rows), non_negative(total_rows)));
        }

        tx.execute(
          "INSERT INTO subject_meta_summary
             (subject_id, observation_count, geographic_levels, first_period, last_period, updated_at)
           SELECT ?1, COUNT(*),
             (SELECT json_group_array(lv) FROM
                (SELECT DISTINCT geographic_level AS lv FROM observations WHERE subject_id = ?1)),
             (SELECT json_object('year', year, 'code', time_identifier) FROM observations
                WHERE subject_id = ?1 ORDER BY year ASC, time_order ASC LIMIT 1),
             (SELECT json_object('year', year, 'code', time_identifier) FROM observations
                WHERE subject_id = ?1 ORDER BY year DESC, time_order DESC LIMIT 1),
             ?2
           FROM observations WHERE subject_id = ?1
           ON CONFLICT (subject_id) DO UPDATE SET
             observation_count = excluded.observation_count,
             geographic_levels = excluded.geographic_levels,
             first_period      = excluded.first_period,
             last_period       = excluded.last_period,
             updated_at        = excluded.updated_at",
          params![subject, now],
        )?;
        tx.execute(
          "UPDATE imports SET status = ?2, updated_at = ?3 WHERE import_id = ?1",
          params![id_str, complete, now],
        )?;
        tx.commit()?;
        Ok(Step::Done)
      })
      .await?;

    match step {
      Step::NotInFinalize(s) => Ok(FinalizeOutcome::NotInFinalize(decode_status(&s)?)),
      Step::Incomplete(completed, expected) => {
        warn!(%import_id, completed, expected, "finalize attempted before all batches recorded");
        Ok(FinalizeOutcome::Incomplete { completed, expected })
      }
      Step::RowMismatch(imported, expected) => {
        warn!(%import_id, imported, expected, "imported rows do not match the data file");
        Ok(FinalizeOutcome::RowCountMismatch { imported, expected })
      }
      Step::Done => {
        let summary = self.subject_summary(record.subject_id).await?.unwrap_or(SubjectSummary {
          subject_id:        record.subject_id,
          observation_count: 0,
          geographic_levels: Vec::new(),
          first_period:      None,
          last_period:       None,
        });
        info!(%import_id, observations = summary.observation_count, "import complete");
        Ok(FinalizeOutcome::Completed(summary))
      }
    }
  }

  async fn require_import(&self, id: Uuid) -> Result<ImportRecord> {
    self.get_import(id).await?.ok_or(Error::ImportNotFound(id))
  }

  /// Subjects of `release_id`, oldest first.
  pub async fn release_subjects(&self, release_id: Uuid) -> Result<Vec<Subject>> {
    let release = encode_uuid(release_id);
    let raws: Vec<RawSubject> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM subjects WHERE release_id = ?1 ORDER BY created_at, rowid",
          RawSubject::COLUMNS
        ))?;
        let rows = stmt.query_map(params![release], RawSubject::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
      })
      .await?;

    raws.into_iter().map(RawSubject::into_subject).collect()
  }

  /// The aggregates recorded by the most recent finalize of `subject_id`.
  pub async fn subject_summary(&self, subject_id: Uuid) -> Result<Option<SubjectSummary>> {
    let id = encode_uuid(subject_id);
    let raw: Option<(i64, String, Option<String>, Option<String>)> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT observation_count, geographic_levels, first_period, last_period
               FROM subject_meta_summary WHERE subject_id = ?1",
              params![id],
              |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?,
        )
      })
      .await?;

    raw
      .map(|(count, levels, first, last)| {
        let mut geographic_levels: Vec<GeographicLevel> = serde_json::from_str(&levels)?;
        geographic_levels.sort();
        Ok(SubjectSummary {
          subject_id,
          observation_count: u64::try_from(count).unwrap_or_default(),
          geographic_levels,
          first_period: first.as_deref().map(serde_json::from_str).transpose()?,
          last_period: last.as_deref().map(serde_json::from_str).transpose()?,
        })
      })
      .transpose()
  }
}

// ─── StatStore impl ──────────────────────────────────────────────────────────

impl StatStore for SqliteStore {
  type Error = Error;

  // ── Subjects ──────────────────────────────────────────────────────────────

  async fn create_subject(&self, release_id: Uuid, name: String) -> Result<Subject> {
    let subject = Subject {
      subject_id: Uuid::new_v4(),
      release_id,
      name,
      created_at: Utc::now(),
    };

    let id_str      = encode_uuid(subject.subject_id);
    let release_str = encode_uuid(release_id);
    let name        = subject.name.clone();
    let at_str      = encode_dt(subject.created_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO subjects (subject_id, release_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
          params![id_str, release_str, name, at_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(subject)
  }

  async fn get_subject(&self, id: Uuid) -> Result<Option<Subject>> {
    let id_str = encode_uuid(id);

    let raw: Option<RawSubject> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {} FROM subjects WHERE subject_id = ?1", RawSubject::COLUMNS),
              params![id_str],
              RawSubject::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawSubject::into_subject).transpose()
  }

  async fn subject_meta(&self, id: Uuid) -> Result<Option<SubjectMeta>> {
    let Some(subject) = self.get_subject(id).await? else {
      return Ok(None);
    };
    let id_str = encode_uuid(id);

    #[allow(clippy::type_complexity)]
    let (filters, groups, items, ind_groups, indicators, locations, periods, levels): (
      Vec<RawFilter>,
      Vec<RawChild>,
      Vec<RawChild>,
      Vec<RawChild>,
      Vec<RawIndicator>,
      Vec<RawLocation>,
      Vec<(i64, String)>,
      Vec<String>,
    ) = self
      .conn
      .call(move |conn| {
        let filters = conn
          .prepare(&format!(
            "SELECT {} FROM filters WHERE subject_id = ?1 ORDER BY rowid",
            RawFilter::COLUMNS
          ))?
          .query_map(params![id_str], RawFilter::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let groups = conn
          .prepare(
            "SELECT g.filter_group_id, g.filter_id, g.label
             FROM filter_groups g JOIN filters f ON f.filter_id = g.filter_id
             WHERE f.subject_id = ?1 ORDER BY g.rowid",
          )?
          .query_map(params![id_str], RawChild::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let items = conn
          .prepare(
            "SELECT i.filter_item_id, i.filter_group_id, i.label
             FROM filter_items i
             JOIN filter_groups g ON g.filter_group_id = i.filter_group_id
             JOIN filters f ON f.filter_id = g.filter_id
             WHERE f.subject_id = ?1 ORDER BY i.rowid",
          )?
          .query_map(params![id_str], RawChild::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let ind_groups = conn
          .prepare(
            "SELECT indicator_group_id, subject_id, label FROM indicator_groups
             WHERE subject_id = ?1 ORDER BY rowid",
          )?
          .query_map(params![id_str], RawChild::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let indicators = conn
          .prepare(&format!(
            "SELECT {} FROM indicators WHERE subject_id = ?1 ORDER BY rowid",
            RawIndicator::COLUMNS
          ))?
          .query_map(params![id_str], RawIndicator::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let locations = conn
          .prepare(
            "SELECT l.location_id, l.geographic_level, l.code, l.name FROM locations l
             WHERE l.location_id IN (SELECT DISTINCT location_id FROM observations WHERE subject_id = ?1)
             ORDER BY l.geographic_level, l.code",
          )?
          .query_map(params![id_str], |r| RawLocation::from_row_at(r, 0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let periods = conn
          .prepare(
            "SELECT DISTINCT year, time_identifier, time_order FROM observations
             WHERE subject_id = ?1 ORDER BY year, time_order",
          )?
          .query_map(params![id_str], |r| Ok((r.get(0)?, r.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let levels = conn
          .prepare("SELECT DISTINCT geographic_level FROM observations WHERE subject_id = ?1")?
          .query_map(params![id_str], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((filters, groups, items, ind_groups, indicators, locations, periods, levels))
      })
      .await?;

    let items: Vec<FilterItem> = items.into_iter().map(RawChild::into_filter_item).collect::<Result<_>>()?;
    let groups: Vec<FilterGroup> =
      groups.into_iter().map(RawChild::into_filter_group).collect::<Result<_>>()?;

    let filters = filters
      .into_iter()
      .map(|raw| {
        let filter = raw.into_filter()?;
        let groups = groups
          .iter()
          .filter(|g| g.filter_id == filter.filter_id)
          .map(|g| FilterGroupMeta {
            group: g.clone(),
            items: items
              .iter()
              .filter(|i| i.filter_group_id == g.filter_group_id)
              .cloned()
              .collect(),
          })
          .collect();
        Ok(FilterMeta { filter, groups })
      })
      .collect::<Result<Vec<_>>>()?;

    let mut geographic_levels = levels
      .iter()
      .map(|l| decode_level(l))
      .collect::<Result<Vec<GeographicLevel>>>()?;
    geographic_levels.sort();

    Ok(Some(SubjectMeta {
      subject,
      filters,
      indicator_groups: ind_groups
        .into_iter()
        .map(RawChild::into_indicator_group)
        .collect::<Result<_>>()?,
      indicators: indicators
        .into_iter()
        .map(RawIndicator::into_indicator)
        .collect::<Result<_>>()?,
      locations: locations
        .into_iter()
        .map(RawLocation::into_location)
        .collect::<Result<_>>()?,
      time_periods: periods
        .into_iter()
        .map(|(year, code)| decode_time_period(year, &code))
        .collect::<Result<_>>()?,
      geographic_levels,
    }))
  }

  // ── Dimensions ────────────────────────────────────────────────────────────

  async fn list_locations(&self) -> Result<Vec<Location>> {
    let raws: Vec<RawLocation> = self
      .conn
      .call(|conn| {
        Ok(
          conn
            .prepare(&format!("SELECT {} FROM locations", RawLocation::COLUMNS))?
            .query_map([], |r| RawLocation::from_row_at(r, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        )
      })
      .await?;
    raws.into_iter().map(RawLocation::into_location).collect()
  }

  async fn get_or_create_location(&self, input: NewLocation) -> Result<Location> {
    let level = encode_level(input.level);
    let raw: RawLocation = self
      .conn
      .call(move |conn| {
        let select = format!(
          "SELECT {} FROM locations WHERE geographic_level = ?1 AND code = ?2",
          RawLocation::COLUMNS
        );
        let created = get_or_insert(
          conn,
          &select,
          params![level, input.code],
          |r| RawLocation::from_row_at(r, 0),
          |conn| {
            let id = encode_uuid(Uuid::new_v4());
            conn.execute(
              "INSERT INTO locations (location_id, geographic_level, code, name) VALUES (?1, ?2, ?3, ?4)",
              params![id, level, input.code, input.name],
            )?;
            Ok(RawLocation {
              location_id:      id,
              geographic_level: level.clone(),
              code:             input.code.clone(),
              name:             input.name.clone(),
            })
          },
        )?;
        Ok(created)
      })
      .await?;
    raw.into_location()
  }

  async fn get_or_create_filter(&self, input: NewFilter) -> Result<Filter> {
    let subject = encode_uuid(input.subject_id);
    let raw: RawFilter = self
      .conn
      .call(move |conn| {
        let select = format!(
          "SELECT {} FROM filters WHERE subject_id = ?1 AND name = ?2",
          RawFilter::COLUMNS
        );
        Ok(get_or_insert(
          conn,
          &select,
          params![subject, input.name],
          RawFilter::from_row,
          |conn| {
            let id = encode_uuid(Uuid::new_v4());
            conn.execute(
              "INSERT INTO filters (filter_id, subject_id, name, label, hint, grouping_column)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
              params![id, subject, input.name, input.label, input.hint, input.grouping_column],
            )?;
            Ok(RawFilter {
              filter_id:       id,
              subject_id:      subject.clone(),
              name:            input.name.clone(),
              label:           input.label.clone(),
              hint:            input.hint.clone(),
              grouping_column: input.grouping_column.clone(),
            })
          },
        )?)
      })
      .await?;
    raw.into_filter()
  }

  async fn get_or_create_filter_group(&self, filter_id: Uuid, label: String) -> Result<FilterGroup> {
    let parent = encode_uuid(filter_id);
    let raw: RawChild = self
      .conn
      .call(move |conn| {
        Ok(get_or_insert(
          conn,
          "SELECT filter_group_id, filter_id, label FROM filter_groups
           WHERE filter_id = ?1 AND label = ?2",
          params![parent, label],
          RawChild::from_row,
          |conn| {
            let id = encode_uuid(Uuid::new_v4());
            conn.execute(
              "INSERT INTO filter_groups (filter_group_id, filter_id, label) VALUES (?1, ?2, ?3)",
              params![id, parent, label],
            )?;
            Ok(RawChild { id, parent_id: parent.clone(), label: label.clone() })
          },
        )?)
      })
      .await?;
    raw.into_filter_group()
  }

  async fn get_or_create_filter_item(&self, filter_group_id: Uuid, label: String) -> Result<FilterItem> {
    let parent = encode_uuid(filter_group_id);
    let raw: RawChild = self
      .conn
      .call(move |conn| {
        Ok(get_or_insert(
          conn,
          "SELECT filter_item_id, filter_group_id, label FROM filter_items
           WHERE filter_group_id = ?1 AND label = ?2",
          params![parent, label],
          RawChild::from_row,
          |conn| {
            let id = encode_uuid(Uuid::new_v4());
            conn.execute(
              "INSERT INTO filter_items (filter_item_id, filter_group_id, label) VALUES (?1, ?2, ?3)",
              params![id, parent, label],
            )?;
            Ok(RawChild { id, parent_id: parent.clone(), label: label.clone() })
          },
        )?)
      })
      .await?;
    raw.into_filter_item()
  }

  async fn get_or_create_indicator(&self, input: NewIndicator) -> Result<Indicator> {
    let subject = encode_uuid(input.subject_id);
    let dp = input.decimal_places.map(i64::from);
    let raw: RawIndicator = self
      .conn
      .call(move |conn| {
        let group = get_or_insert(
          conn,
          "SELECT indicator_group_id, subject_id, label FROM indicator_groups
           WHERE subject_id = ?1 AND label = ?2",
          params![subject, input.group_label],
          RawChild::from_row,
          |conn| {
            let id = encode_uuid(Uuid::new_v4());
            conn.execute(
              "INSERT INTO indicator_groups (indicator_group_id, subject_id, label) VALUES (?1, ?2, ?3)",
              params![id, subject, input.group_label],
            )?;
            Ok(RawChild { id, parent_id: subject.clone(), label: input.group_label.clone() })
          },
        )?;

        let select = format!(
          "SELECT {} FROM indicators WHERE subject_id = ?1 AND name = ?2",
          RawIndicator::COLUMNS
        );
        Ok(get_or_insert(
          conn,
          &select,
          params![subject, input.name],
          RawIndicator::from_row,
          |conn| {
            let id = encode_uuid(Uuid::new_v4());
            conn.execute(
              "INSERT INTO indicators
                 (indicator_id, indicator_group_id, subject_id, name, label, unit, decimal_places)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
              params![id, group.id, subject, input.name, input.label, input.unit, dp],
            )?;
            Ok(RawIndicator {
              indicator_id:       id,
              indicator_group_id: group.id.clone(),
              subject_id:         subject.clone(),
              name:               input.name.clone(),
              label:              input.label.clone(),
              unit:               input.unit.clone(),
              decimal_places:     dp,
            })
          },
        )?)
      })
      .await?;
    raw.into_indicator()
  }

  // ── Imports ───────────────────────────────────────────────────────────────

  async fn create_import(&self, input: NewImport) -> Result<ImportRecord> {
    let id          = encode_uuid(input.import_id);
    let subject     = encode_uuid(input.subject_id);
    let release     = encode_uuid(input.release_id);
    let message     = encode_json(&input.message)?;
    let status      = ImportStatus::Queued.as_ref().to_owned();
    let now         = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO imports (
             import_id, subject_id, release_id, data_file_name, meta_file_name,
             status, last_message, created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
          params![
            id,
            subject,
            release,
            input.data_file_name,
            input.meta_file_name,
            status,
            message,
            now,
          ],
        )?;
        Ok(())
      })
      .await?;

    info!(import_id = %input.import_id, "import created");
    self.require_import(input.import_id).await
  }

  async fn get_import(&self, id: Uuid) -> Result<Option<ImportRecord>> {
    let id_str = encode_uuid(id);
    let raw: Option<RawImport> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {} FROM imports i WHERE i.import_id = ?1", RawImport::COLUMNS),
              params![id_str],
              RawImport::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawImport::into_record).transpose()
  }

  async fn list_imports<'a>(&'a self, statuses: &'a [ImportStatus]) -> Result<Vec<ImportRecord>> {
    if statuses.is_empty() {
      return Ok(Vec::new());
    }
    let statuses: Vec<String> = statuses.iter().map(|s| s.as_ref().to_owned()).collect();
    let raws: Vec<RawImport> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {} FROM imports i WHERE i.status IN ({}) ORDER BY i.rowid",
          RawImport::COLUMNS,
          vec!["?"; statuses.len()].join(", ")
        );
        Ok(
          conn
            .prepare(&sql)?
            .query_map(params_from_iter(statuses.iter()), RawImport::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        )
      })
      .await?;
    raws.into_iter().map(RawImport::into_record).collect()
  }

  async fn transition_import(&self, id: Uuid, from: ImportStatus, to: ImportStatus) -> Result<bool> {
    from.check_transition(to)?;
    let id_str = encode_uuid(id);
    let (from_s, to_s) = (from.as_ref().to_owned(), to.as_ref().to_owned());
    let now = encode_dt(Utc::now());

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE imports SET status = ?3, updated_at = ?4 WHERE import_id = ?1 AND status = ?2",
          params![id_str, from_s, to_s, now],
        )?)
      })
      .await?;

    if changed == 1 {
      info!(import_id = %id, %from, %to, "import status changed");
    } else {
      debug!(import_id = %id, expected = %from, %to, "status compare-and-set lost");
    }
    Ok(changed == 1)
  }

  async fn restart_import(&self, id: Uuid) -> Result<bool> {
    let id_str = encode_uuid(id);
    let queued = ImportStatus::Queued.as_ref().to_owned();
    let now = encode_dt(Utc::now());

    let restarted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
          &format!(
            "UPDATE imports SET status = ?2, rows_per_batch = 0, total_rows = 0, num_batches = 0,
               imported_rows = 0, geographic_levels = '[]', data_columns = '[]', errors = '[]',
               checksum = NULL, updated_at = ?3
             WHERE import_id = ?1 AND status NOT IN {TERMINAL}"
          ),
          params![id_str, queued, now],
        )?;
        if changed == 1 {
          tx.execute("DELETE FROM observations WHERE import_id = ?1", params![id_str])?;
          tx.execute("DELETE FROM import_batches WHERE import_id = ?1", params![id_str])?;
        }
        tx.commit()?;
        Ok(changed == 1)
      })
      .await?;

    if restarted {
      warn!(import_id = %id, "import restarted from QUEUED");
    }
    Ok(restarted)
  }

  async fn update_import(&self, id: Uuid, update: ImportUpdate) -> Result<()> {
    let id_str  = encode_uuid(id);
    let levels  = encode_json(&update.geographic_levels)?;
    let columns = encode_json(&update.data_columns)?;
    let now     = encode_dt(Utc::now());

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE imports SET
             rows_per_batch    = ?2,
             total_rows        = ?3,
             num_batches       = CASE WHEN num_batches = 0 THEN ?4 ELSE num_batches END,
             geographic_levels = ?5,
             data_columns      = ?6,
             checksum          = COALESCE(?7, checksum),
             updated_at        = ?8
           WHERE import_id = ?1",
          params![
            id_str,
            update.rows_per_batch,
            i64::try_from(update.total_rows).unwrap_or(i64::MAX),
            update.num_batches,
            levels,
            columns,
            update.checksum,
            now,
          ],
        )?)
      })
      .await?;

    if changed == 0 {
      return Err(Error::ImportNotFound(id));
    }
    Ok(())
  }

  async fn fail_import(&self, id: Uuid, errors: Vec<ImportErrorEntry>) -> Result<bool> {
    let id_str  = encode_uuid(id);
    let entries = errors.iter().map(encode_json).collect::<Result<Vec<_>>>()?;
    let failed  = ImportStatus::Failed.as_ref().to_owned();
    let now     = encode_dt(Utc::now());

    let changed = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
          &format!(
            "UPDATE imports SET status = ?2, updated_at = ?3
             WHERE import_id = ?1 AND status NOT IN {TERMINAL}"
          ),
          params![id_str, failed, now],
        )?;
        if changed == 1 {
          append_errors(&tx, &id_str, &entries)?;
        }
        tx.commit()?;
        Ok(changed == 1)
      })
      .await?;

    if changed {
      tracing::error!(import_id = %id, errors = errors.len(), "import failed");
    }
    Ok(changed)
  }

  async fn cancel_import(&self, id: Uuid) -> Result<bool> {
    let id_str    = encode_uuid(id);
    let cancelled = ImportStatus::Cancelled.as_ref().to_owned();
    let now       = encode_dt(Utc::now());

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          &format!(
            "UPDATE imports SET status = ?2, updated_at = ?3
             WHERE import_id = ?1 AND status NOT IN {TERMINAL}"
          ),
          params![id_str, cancelled, now],
        )?)
      })
      .await?;

    if changed == 1 {
      info!(import_id = %id, "import cancelled");
    }
    Ok(changed == 1)
  }

  async fn record_import_errors(&self, id: Uuid, errors: Vec<ImportErrorEntry>) -> Result<()> {
    let id_str  = encode_uuid(id);
    let entries = errors.iter().map(encode_json).collect::<Result<Vec<_>>>()?;
    let now     = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        append_errors(&tx, &id_str, &entries)?;
        tx.execute(
          "UPDATE imports SET updated_at = ?2 WHERE import_id = ?1",
          params![id_str, now],
        )?;
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Observations ──────────────────────────────────────────────────────────

  async fn import_batch(&self, batch: ObservationBatch) -> Result<BatchOutcome> {
    let import_id = batch.import_id;
    let batch_no  = batch.batch_no;
    let id_str    = encode_uuid(import_id);
    let subject   = encode_uuid(batch.subject_id);
    let rows      = batch.observations.len() as u64;
    let now       = encode_dt(Utc::now());
    let expected  = ImportStatus::ImportObservations.as_ref().to_owned();

    enum Write {
      Committed,
      Duplicate,
      WrongStatus(String),
      Missing,
    }

    // Encode outside the connection thread.
    let observations = batch
      .observations
      .iter()
      .map(|o| {
        Ok((
          encode_uuid(Uuid::new_v4()),
          encode_uuid(o.location_id),
          encode_level(o.geographic_level),
          i64::from(o.time_period.year),
          o.time_period.identifier.code(),
          o.time_period.identifier.ordinal(),
          i64::try_from(o.csv_row).unwrap_or(i64::MAX),
          encode_measures(&o.measures)?,
          o.filter_item_ids.iter().map(|id| encode_uuid(*id)).collect::<Vec<_>>(),
        ))
      })
      .collect::<Result<Vec<_>>>()?;

    let write = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
          .query_row("SELECT status FROM imports WHERE import_id = ?1", params![id_str], |r| r.get(0))
          .optional()?;
        match status {
          None => return Ok(Write::Missing),
          Some(s) if s != expected => return Ok(Write::WrongStatus(s)),
          Some(_) => {}
        }

        let inserted = tx.execute(
          "INSERT OR IGNORE INTO import_batches (import_id, batch_no, rows, imported_at)
           VALUES (?1, ?2, ?3, ?4)",
          params![id_str, batch_no, rows as i64, now],
        )?;
        if inserted == 0 {
          return Ok(Write::Duplicate);
        }

        {
          let mut obs = tx.prepare_cached(
            "INSERT INTO observations (
               observation_id, subject_id, import_id, location_id, geographic_level,
               year, time_identifier, time_order, csv_row, measures
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
          )?;
          let mut junction = tx.prepare_cached(
            "INSERT INTO observation_filter_items (observation_id, filter_item_id) VALUES (?1, ?2)",
          )?;
          for (obs_id, location, level, year, code, order, csv_row, measures, items) in &observations {
            obs.execute(params![
              obs_id, subject, id_str, location, level, year, code, order, csv_row, measures
            ])?;
            for item in items {
              junction.execute(params![obs_id, item])?;
            }
          }
        }

        tx.execute(
          "UPDATE imports SET imported_rows = imported_rows + ?2, updated_at = ?3 WHERE import_id = ?1",
          params![id_str, rows as i64, now],
        )?;
        tx.commit()?;
        Ok(Write::Committed)
      })
      .await?;

    match write {
      Write::Committed => {
        debug!(%import_id, batch_no, rows, "batch committed");
        Ok(BatchOutcome::Imported { rows })
      }
      Write::Duplicate => {
        warn!(%import_id, batch_no, "batch already imported; skipping");
        Ok(BatchOutcome::AlreadyImported)
      }
      Write::WrongStatus(s) => {
        let status = decode_status(&s)?;
        warn!(%import_id, batch_no, %status, "batch rejected; import left the observation phase");
        Ok(BatchOutcome::Rejected { status })
      }
      Write::Missing => Err(Error::ImportNotFound(import_id)),
    }
  }

  async fn imported_batches(&self, import_id: Uuid) -> Result<Vec<u32>> {
    let id_str = encode_uuid(import_id);
    Ok(
      self
        .conn
        .call(move |conn| {
          Ok(
            conn
              .prepare("SELECT batch_no FROM import_batches WHERE import_id = ?1 ORDER BY batch_no")?
              .query_map(params![id_str], |r| r.get(0))?
              .collect::<rusqlite::Result<Vec<u32>>>()?,
          )
        })
        .await?,
    )
  }

  async fn finalize_import(&self, import_id: Uuid) -> Result<FinalizeOutcome> {
    let record = self.require_import(import_id).await?;
    let lock = format!("finalize:{import_id}");
    let Some(token) = self.try_lock(&lock).await? else {
      warn!(%import_id, "finalize already running elsewhere");
      return Ok(FinalizeOutcome::Locked);
    };

    let outcome = self.finalize_locked(&record).await;
    self.unlock(&lock, token).await?;
    outcome
  }

  // ── Queries ───────────────────────────────────────────────────────────────

  async fn query_observations<'a>(&'a self, query: &'a ObservationQuery) -> Result<ObservationPage> {
    let predicate = compile(&query.facets);
    let order = order_by(&query.sort);
    let subject = encode_uuid(query.subject_id);
    let limit = i64::from(query.page_size);
    let offset = i64::from(query.page.saturating_sub(1)) * limit;

    let (total, raws): (i64, Vec<RawObservation>) = self
      .conn
      .call(move |conn| {
        let mut count_params = vec![Value::Text(subject)];
        count_params.extend(predicate.params);

        let total: i64 = conn.query_row(
          &format!(
            "SELECT COUNT(*) FROM observations o WHERE o.subject_id = ? AND {}",
            predicate.sql
          ),
          params_from_iter(count_params.iter()),
          |r| r.get(0),
        )?;

        let mut page_params = count_params;
        page_params.extend(order.params);
        page_params.push(Value::Integer(limit));
        page_params.push(Value::Integer(offset));

        let sql = format!(
          "SELECT {} FROM observations o JOIN locations l ON l.location_id = o.location_id
           WHERE o.subject_id = ? AND {}
           ORDER BY {}
           LIMIT ? OFFSET ?",
          RawObservation::COLUMNS,
          predicate.sql,
          order.sql
        );
        let rows = conn
          .prepare(&sql)?
          .query_map(params_from_iter(page_params.iter()), RawObservation::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((total, rows))
      })
      .await?;

    Ok(ObservationPage {
      rows:          raws
        .into_iter()
        .map(|r| r.into_row(&query.indicators))
        .collect::<Result<_>>()?,
      total_results: u64::try_from(total).unwrap_or_default(),
    })
  }

  async fn stream_observations<'a>(
    &'a self,
    query: &'a ObservationQuery,
    cursor: Option<i64>,
    limit: u32,
  ) -> Result<ObservationChunk> {
    let predicate = compile(&query.facets);
    let subject = encode_uuid(query.subject_id);

    let raws: Vec<RawObservation> = self
      .conn
      .call(move |conn| {
        let mut params = vec![Value::Text(subject), Value::Integer(cursor.unwrap_or(0))];
        params.extend(predicate.params);
        params.push(Value::Integer(i64::from(limit)));

        let sql = format!(
          "SELECT {} FROM observations o JOIN locations l ON l.location_id = o.location_id
           WHERE o.subject_id = ? AND o.rowid > ? AND {}
           ORDER BY o.rowid
           LIMIT ?",
          RawObservation::COLUMNS,
          predicate.sql
        );
        Ok(
          conn
            .prepare(&sql)?
            .query_map(params_from_iter(params.iter()), RawObservation::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        )
      })
      .await?;

    let next_cursor = if raws.len() == limit as usize { raws.last().map(|r| r.rowid) } else { None };
    Ok(ObservationChunk {
      rows: raws
        .into_iter()
        .map(|r| r.into_row(&query.indicators))
        .collect::<Result<_>>()?,
      next_cursor,
    })
  }

  // ── Footnotes ─────────────────────────────────────────────────────────────

  async fn add_footnote(&self, input: NewFootnote) -> Result<Footnote> {
    let footnote = Footnote {
      footnote_id: Uuid::new_v4(),
      content:     input.content,
      scopes:      input.scopes,
      created_at:  Utc::now(),
    };

    let id_str  = encode_uuid(footnote.footnote_id);
    let content = footnote.content.clone();
    let at_str  = encode_dt(footnote.created_at);
    let scopes: Vec<(&'static str, String)> = footnote.scopes.iter().copied().map(encode_scope).collect();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO footnotes (footnote_id, content, created_at) VALUES (?1, ?2, ?3)",
          params![id_str, content, at_str],
        )?;
        for (kind, target) in &scopes {
          tx.execute(
            "INSERT OR IGNORE INTO footnote_scopes (footnote_id, scope_type, target_id)
             VALUES (?1, ?2, ?3)",
            params![id_str, kind, target],
          )?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;

    Ok(footnote)
  }

  async fn footnotes_for<'a>(&'a self, target: &'a FootnoteTarget) -> Result<Vec<Footnote>> {
    let ids: BTreeSet<String> = std::iter::once(target.subject_id)
      .chain(target.filters.iter().copied())
      .chain(target.filter_groups.iter().copied())
      .chain(target.filter_items.iter().copied())
      .chain(target.indicators.iter().copied())
      .map(encode_uuid)
      .collect();

    let raws: Vec<RawFootnote> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT fn.footnote_id, fn.content, fn.created_at FROM footnotes fn
           WHERE fn.footnote_id IN (
             SELECT footnote_id FROM footnote_scopes WHERE target_id IN ({}))
           ORDER BY fn.rowid",
          vec!["?"; ids.len()].join(", ")
        );
        let mut footnotes = conn
          .prepare(&sql)?
          .query_map(params_from_iter(ids.iter()), |r| {
            Ok(RawFootnote {
              footnote_id: r.get(0)?,
              content:     r.get(1)?,
              created_at:  r.get(2)?,
              scopes:      Vec::new(),
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare_cached(
          "SELECT scope_type, target_id FROM footnote_scopes WHERE footnote_id = ?1",
        )?;
        for f in &mut footnotes {
          f.scopes = stmt
            .query_map(params![f.footnote_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        }
        Ok(footnotes)
      })
      .await?;

    let mut footnotes = raws
      .into_iter()
      .map(RawFootnote::into_footnote)
      .collect::<Result<Vec<_>>>()?;
    footnotes.retain(|f| f.scopes.iter().any(|s| target.matches(s)));
    Ok(footnotes)
  }
}
