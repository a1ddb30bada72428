//! Materialising a data file's batches in blob storage.

use std::{collections::BTreeSet, sync::Arc};

use bytes::Bytes;
use strata_core::{
  blob::{BlobStore, batch_no_from_path, batch_path, batch_prefix, data_path},
  import::ImportRecord,
  store::StatStore,
};
use strata_csv::split_batches;
use tracing::{debug, info};

use crate::{Error, Result};

pub struct Splitter<S, B> {
  store: Arc<S>,
  blobs: Arc<B>,
}

impl<S: StatStore, B: BlobStore> Splitter<S, B> {
  pub fn new(store: Arc<S>, blobs: Arc<B>) -> Self { Self { store, blobs } }

  /// Write every batch of `record`'s data file that is neither already in
  /// storage nor already imported, and return the batch numbers still to be
  /// imported, ascending. Safe to call again after a partial run.
  ///
  /// A single-batch import reads the uploaded data file directly, so nothing
  /// is written for it.
  pub async fn split(&self, record: &ImportRecord) -> Result<Vec<u32>> {
    let imported: BTreeSet<u32> = self
      .store
      .imported_batches(record.import_id)
      .await
      .map_err(Error::store)?
      .into_iter()
      .collect();

    if record.num_batches <= 1 {
      return Ok(if imported.contains(&1) { vec![] } else { vec![1] });
    }

    let prefix = batch_prefix(record.release_id, record.import_id, &record.data_file_name);
    let existing: BTreeSet<u32> = self
      .blobs
      .list(&prefix)
      .await
      .map_err(Error::blob)?
      .iter()
      .filter_map(|p| batch_no_from_path(p))
      .collect();

    let pending: Vec<u32> = (1..=record.num_batches)
      .filter(|n| !imported.contains(n))
      .collect();
    let missing = pending.iter().any(|n| !existing.contains(n));

    if missing {
      let source = data_path(record.release_id, record.import_id, &record.data_file_name);
      let data = self
        .blobs
        .get(&source)
        .await
        .map_err(Error::blob)?
        .ok_or(Error::MissingBlob(source))?;

      let mut written = 0;
      for batch in split_batches(&data, record.rows_per_batch)? {
        if imported.contains(&batch.batch_no) || existing.contains(&batch.batch_no) {
          continue;
        }
        let path =
          batch_path(record.release_id, record.import_id, &record.data_file_name, batch.batch_no);
        self
          .blobs
          .put(&path, Bytes::from(batch.data))
          .await
          .map_err(Error::blob)?;
        written += 1;
      }
      info!(
        import_id = %record.import_id,
        written,
        skipped = existing.len(),
        num_batches = record.num_batches,
        "split data file"
      );
    } else {
      debug!(import_id = %record.import_id, "every pending batch already materialised");
    }

    Ok(pending)
  }
}
