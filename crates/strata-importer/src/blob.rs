//! [`BlobStore`] implementations: a directory on local disk and an
//! in-memory map for tests.

use std::{
  collections::BTreeMap,
  convert::Infallible,
  io::ErrorKind,
  path::{Component, Path, PathBuf},
  sync::{PoisonError, RwLock},
};

use bytes::Bytes;
use strata_core::blob::BlobStore;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FsBlobError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("invalid blob path: {0:?}")]
  InvalidPath(String),
}

// ─── Filesystem ──────────────────────────────────────────────────────────────

/// Blobs as files under `root`. Writes go to a sibling temp file and are
/// renamed into place, so readers see either the old or the new contents.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
  root: PathBuf,
}

const TMP_MARKER: &str = ".tmp-";

impl FsBlobStore {
  pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

  pub fn root(&self) -> &Path { &self.root }

  fn resolve(&self, path: &str) -> Result<PathBuf, FsBlobError> {
    let relative = Path::new(path);
    let clean = relative
      .components()
      .all(|c| matches!(c, Component::Normal(_)));
    if !clean || path.is_empty() || path.contains(TMP_MARKER) {
      return Err(FsBlobError::InvalidPath(path.to_owned()));
    }
    Ok(self.root.join(relative))
  }
}

impl BlobStore for FsBlobStore {
  type Error = FsBlobError;

  async fn put<'a>(&'a self, path: &'a str, data: Bytes) -> Result<(), FsBlobError> {
    let target = self.resolve(path)?;
    if let Some(parent) = target.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = target.clone().into_os_string();
    tmp.push(format!("{TMP_MARKER}{}", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &target).await {
      let _ = tokio::fs::remove_file(&tmp).await;
      return Err(e.into());
    }
    Ok(())
  }

  async fn get<'a>(&'a self, path: &'a str) -> Result<Option<Bytes>, FsBlobError> {
    match tokio::fs::read(self.resolve(path)?).await {
      Ok(data) => Ok(Some(Bytes::from(data))),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  /// The prefix is matched within one directory: everything up to its last
  /// `/` names the directory, the rest is a file-name prefix.
  async fn list<'a>(&'a self, prefix: &'a str) -> Result<Vec<String>, FsBlobError> {
    let (dir, name_prefix) = prefix.rsplit_once('/').unwrap_or(("", prefix));
    let dir_path = if dir.is_empty() { self.root.clone() } else { self.resolve(dir)? };

    let mut entries = match tokio::fs::read_dir(&dir_path).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
      if !entry.file_type().await?.is_file() {
        continue;
      }
      let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
        continue;
      };
      if name.starts_with(name_prefix) && !name.contains(TMP_MARKER) {
        paths.push(if dir.is_empty() { name } else { format!("{dir}/{name}") });
      }
    }
    paths.sort();
    Ok(paths)
  }

  async fn delete<'a>(&'a self, path: &'a str) -> Result<(), FsBlobError> {
    match tokio::fs::remove_file(self.resolve(path)?).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }
}

// ─── Memory ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
  blobs: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBlobStore {
  pub fn new() -> Self { Self::default() }

  pub fn len(&self) -> usize { self.blobs.read().unwrap_or_else(PoisonError::into_inner).len() }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl BlobStore for MemoryBlobStore {
  type Error = Infallible;

  async fn put<'a>(&'a self, path: &'a str, data: Bytes) -> Result<(), Infallible> {
    let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
    blobs.insert(path.to_owned(), data);
    Ok(())
  }

  async fn get<'a>(&'a self, path: &'a str) -> Result<Option<Bytes>, Infallible> {
    let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
    Ok(blobs.get(path).cloned())
  }

  async fn list<'a>(&'a self, prefix: &'a str) -> Result<Vec<String>, Infallible> {
    let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
    Ok(
      blobs
        .range(prefix.to_owned()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }

  async fn delete<'a>(&'a self, path: &'a str) -> Result<(), Infallible> {
    let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
    blobs.remove(path);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn fs_round_trip_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = FsBlobStore::new(dir.path());

    blobs.put("r/data/batches/a.csv-000002", Bytes::from_static(b"two")).await.unwrap();
    blobs.put("r/data/batches/a.csv-000001", Bytes::from_static(b"one")).await.unwrap();
    blobs.put("r/data/batches/b.csv-000001", Bytes::from_static(b"other")).await.unwrap();

    let listed = blobs.list("r/data/batches/a.csv-").await.unwrap();
    assert_eq!(listed, vec!["r/data/batches/a.csv-000001", "r/data/batches/a.csv-000002"]);
    assert_eq!(
      blobs.get("r/data/batches/a.csv-000002").await.unwrap().as_deref(),
      Some(&b"two"[..])
    );

    blobs.delete("r/data/batches/a.csv-000001").await.unwrap();
    blobs.delete("r/data/batches/a.csv-000001").await.unwrap();
    assert!(blobs.get("r/data/batches/a.csv-000001").await.unwrap().is_none());
    assert!(blobs.list("missing/dir/x").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn fs_rejects_escaping_paths() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = FsBlobStore::new(dir.path());
    assert!(matches!(
      blobs.put("../outside", Bytes::new()).await,
      Err(FsBlobError::InvalidPath(_))
    ));
    assert!(matches!(blobs.get("/etc/passwd").await, Err(FsBlobError::InvalidPath(_))));
  }

  #[tokio::test]
  async fn memory_list_is_prefix_scoped() {
    let blobs = MemoryBlobStore::new();
    for path in ["a/1", "a/2", "ab/1", "b/1"] {
      blobs.put(path, Bytes::from_static(b"x")).await.unwrap();
    }
    assert_eq!(blobs.list("a/").await.unwrap(), vec!["a/1", "a/2"]);
    assert_eq!(blobs.list("a").await.unwrap(), vec!["a/1", "a/2", "ab/1"]);
  }
}
