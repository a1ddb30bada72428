//! The file-storage seam and the pipeline's storage layout.
//!
//! ```text
//! {release}/{import}/data/{file}                     uploaded data and meta files
//! {release}/{import}/data/batches/{file}-{n:06}      materialised batches
//! ```
//!
//! Keying by import keeps two uploads of the same file name into one release
//! apart.

use std::future::Future;

use bytes::Bytes;
use uuid::Uuid;

pub trait BlobStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Write `data` at `path`, replacing any existing blob. Readers never
  /// observe a partially written blob.
  fn put<'a>(
    &'a self,
    path: &'a str,
    data: Bytes,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn get<'a>(
    &'a self,
    path: &'a str,
  ) -> impl Future<Output = Result<Option<Bytes>, Self::Error>> + Send + 'a;

  /// Paths of every blob whose path starts with `prefix`, sorted.
  fn list<'a>(
    &'a self,
    prefix: &'a str,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'a;

  /// Remove a blob. Removing a missing blob is not an error.
  fn delete<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// Where an uploaded file of `import` is stored.
pub fn data_path(release: Uuid, import: Uuid, file_name: &str) -> String {
  format!("{release}/{import}/data/{file_name}")
}

/// Prefix under which every batch of `file_name` lives.
pub fn batch_prefix(release: Uuid, import: Uuid, file_name: &str) -> String {
  format!("{release}/{import}/data/batches/{file_name}-")
}

pub fn batch_path(release: Uuid, import: Uuid, file_name: &str, batch_no: u32) -> String {
  format!("{}{batch_no:06}", batch_prefix(release, import, file_name))
}

/// Recover the batch number from a path produced by [`batch_path`].
pub fn batch_no_from_path(path: &str) -> Option<u32> {
  let (_, suffix) = path.rsplit_once('-')?;
  if suffix.len() != 6 {
    return None;
  }
  suffix.parse().ok()
}
