use std::time::Duration;

use serde::Deserialize;

/// Importer tuning, read from the `[importer]` table of the server config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
  /// Rows per batch, and the size above which a file is split at all.
  pub row_limit_per_batch: u32,
  /// Concurrent queue consumers.
  pub workers:             usize,
  /// Deliveries before a message is dead-lettered.
  pub max_delivery_count:  u32,
  /// How long an idle worker waits on each queue per poll.
  pub poll_interval_ms:    u64,
}

impl Default for ImporterConfig {
  fn default() -> Self {
    Self {
      row_limit_per_batch: 5000,
      workers:             4,
      max_delivery_count:  5,
      poll_interval_ms:    500,
    }
  }
}

impl ImporterConfig {
  pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
}
