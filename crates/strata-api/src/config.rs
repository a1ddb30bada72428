use std::time::Duration;

use serde::Deserialize;

/// Query engine limits, deserialised from the `[query]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  /// Page size used when a request names none, capped at `max_page_size`.
  pub default_page_size:   u32,
  pub max_page_size:       u32,
  /// Wall-clock budget for one CSV export, from the first chunk to the last.
  /// Zero cuts every export short.
  pub export_timeout_secs: u64,
  /// Rows fetched from the store per export chunk.
  pub export_chunk_size:   u32,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      default_page_size:   1000,
      max_page_size:       10_000,
      export_timeout_secs: 120,
      export_chunk_size:   1000,
    }
  }
}

impl QueryConfig {
  pub fn export_timeout(&self) -> Duration { Duration::from_secs(self.export_timeout_secs) }
}
