//! SQL schema for the strata SQLite store.
//!
//! [`SCHEMA`] runs only while the database's `PRAGMA user_version` is below
//! [`SCHEMA_VERSION`]; it sets the version as its last statement. Future
//! migrations will be gated on that number. [`CONNECTION_PRAGMAS`] are
//! per-connection and run on every open.

/// Version written by [`SCHEMA`].
pub const SCHEMA_VERSION: i64 = 1;

pub const CONNECTION_PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
";

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subjects (
    subject_id  TEXT PRIMARY KEY,
    release_id  TEXT NOT NULL,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

-- Dimension rows are never updated once written. Each natural key is backed
-- by a unique constraint; concurrent creators re-read on conflict.
CREATE TABLE IF NOT EXISTS locations (
    location_id      TEXT PRIMARY KEY,
    geographic_level TEXT NOT NULL,
    code             TEXT NOT NULL,
    name             TEXT NOT NULL,
    UNIQUE (geographic_level, code)
);

CREATE TABLE IF NOT EXISTS filters (
    filter_id       TEXT PRIMARY KEY,
    subject_id      TEXT NOT NULL REFERENCES subjects(subject_id),
    name            TEXT NOT NULL,
    label           TEXT NOT NULL,
    hint            TEXT,
    grouping_column TEXT,
    UNIQUE (subject_id, name)
);

CREATE TABLE IF NOT EXISTS filter_groups (
    filter_group_id TEXT PRIMARY KEY,
    filter_id       TEXT NOT NULL REFERENCES filters(filter_id),
    label           TEXT NOT NULL,
    UNIQUE (filter_id, label)
);

CREATE TABLE IF NOT EXISTS filter_items (
    filter_item_id  TEXT PRIMARY KEY,
    filter_group_id TEXT NOT NULL REFERENCES filter_groups(filter_group_id),
    label           TEXT NOT NULL,
    UNIQUE (filter_group_id, label)
);

CREATE TABLE IF NOT EXISTS indicator_groups (
    indicator_group_id TEXT PRIMARY KEY,
    subject_id         TEXT NOT NULL REFERENCES subjects(subject_id),
    label              TEXT NOT NULL,
    UNIQUE (subject_id, label)
);

CREATE TABLE IF NOT EXISTS indicators (
    indicator_id       TEXT PRIMARY KEY,
    indicator_group_id TEXT NOT NULL REFERENCES indicator_groups(indicator_group_id),
    subject_id         TEXT NOT NULL REFERENCES subjects(subject_id),
    name               TEXT NOT NULL,
    label              TEXT NOT NULL,
    unit               TEXT,
    decimal_places     INTEGER,
    UNIQUE (subject_id, name)
);

-- The implicit rowid is the keyset cursor for exports.
CREATE TABLE IF NOT EXISTS observations (
    observation_id   TEXT PRIMARY KEY,
    subject_id       TEXT NOT NULL REFERENCES subjects(subject_id),
    import_id        TEXT NOT NULL,
    location_id      TEXT NOT NULL REFERENCES locations(location_id),
    geographic_level TEXT NOT NULL,
    year             INTEGER NOT NULL,
    time_identifier  TEXT NOT NULL,   -- short code, e.g. 'AY'
    time_order       INTEGER NOT NULL, -- identifier ordinal within a year
    csv_row          INTEGER NOT NULL,
    measures         TEXT NOT NULL    -- JSON object: indicator_id -> source string
);

CREATE TABLE IF NOT EXISTS observation_filter_items (
    observation_id TEXT NOT NULL REFERENCES observations(observation_id) ON DELETE CASCADE,
    filter_item_id TEXT NOT NULL REFERENCES filter_items(filter_item_id) ON DELETE RESTRICT,
    PRIMARY KEY (observation_id, filter_item_id)
);

CREATE INDEX IF NOT EXISTS observations_subject_idx
    ON observations(subject_id, geographic_level, year, time_order);
CREATE INDEX IF NOT EXISTS observations_location_idx ON observations(location_id);
CREATE INDEX IF NOT EXISTS observations_import_idx   ON observations(import_id);
CREATE INDEX IF NOT EXISTS observation_filter_items_item_idx
    ON observation_filter_items(filter_item_id, observation_id);

CREATE TABLE IF NOT EXISTS imports (
    import_id         TEXT PRIMARY KEY,
    subject_id        TEXT NOT NULL,
    release_id        TEXT NOT NULL,
    data_file_name    TEXT NOT NULL,
    meta_file_name    TEXT NOT NULL,
    status            TEXT NOT NULL,
    rows_per_batch    INTEGER NOT NULL DEFAULT 0,
    total_rows        INTEGER NOT NULL DEFAULT 0,
    num_batches       INTEGER NOT NULL DEFAULT 0,
    imported_rows     INTEGER NOT NULL DEFAULT 0,
    geographic_levels TEXT NOT NULL DEFAULT '[]',
    data_columns      TEXT NOT NULL DEFAULT '[]',
    last_message      TEXT,            -- JSON ImportMessage
    errors            TEXT NOT NULL DEFAULT '[]',
    checksum          TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS imports_status_idx ON imports(status);
CREATE INDEX IF NOT EXISTS imports_file_idx   ON imports(subject_id, data_file_name);

-- One row per batch committed; the primary key makes redelivery a no-op.
CREATE TABLE IF NOT EXISTS import_batches (
    import_id   TEXT NOT NULL REFERENCES imports(import_id),
    batch_no    INTEGER NOT NULL,
    rows        INTEGER NOT NULL,
    imported_at TEXT NOT NULL,
    PRIMARY KEY (import_id, batch_no)
);

-- Named locks, committed on acquire so every connection sees them.
CREATE TABLE IF NOT EXISTS app_locks (
    name        TEXT PRIMARY KEY,
    acquired_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subject_meta_summary (
    subject_id        TEXT PRIMARY KEY REFERENCES subjects(subject_id),
    observation_count INTEGER NOT NULL,
    geographic_levels TEXT NOT NULL,   -- JSON array
    first_period      TEXT,            -- JSON TimePeriod
    last_period       TEXT,            -- JSON TimePeriod
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS footnotes (
    footnote_id TEXT PRIMARY KEY,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS footnote_scopes (
    footnote_id TEXT NOT NULL REFERENCES footnotes(footnote_id) ON DELETE CASCADE,
    scope_type  TEXT NOT NULL,   -- 'subject' | 'filter' | 'filterGroup' | 'filterItem' | 'indicator'
    target_id   TEXT NOT NULL,
    PRIMARY KEY (footnote_id, scope_type, target_id)
);

CREATE INDEX IF NOT EXISTS footnote_scopes_target_idx ON footnote_scopes(target_id);

PRAGMA user_version = 1;
";
