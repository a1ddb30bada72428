//! Splitting a data file into row batches.
//!
//! Batch 1 keeps the header row; batches 2..N are headerless and are paired
//! at import time with the columns recorded when the meta file was imported.

use crate::{Result, data::data_reader};

/// One materialised batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
  /// 1-based.
  pub batch_no:  u32,
  /// Row number (1-based, excluding the header) of the batch's first row.
  pub first_row: u64,
  pub rows:      u64,
  pub data:      Vec<u8>,
}

impl Batch {
  pub fn has_header(&self) -> bool { self.batch_no == 1 }
}

/// Number of data rows, excluding the header.
pub fn count_rows(input: &[u8]) -> Result<u64> {
  let mut reader = data_reader(input, true);
  let mut record = csv::ByteRecord::new();
  let mut rows = 0;
  while reader.read_byte_record(&mut record)? {
    rows += 1;
  }
  Ok(rows)
}

/// How many batches a file of `total_rows` rows is cut into. Files at or
/// under the threshold are imported whole as a single batch.
pub fn batch_count(total_rows: u64, rows_per_batch: u32) -> u32 {
  let per = u64::from(rows_per_batch.max(1));
  if total_rows <= per {
    1
  } else {
    u32::try_from(total_rows.div_ceil(per)).unwrap_or(u32::MAX)
  }
}

/// First data row number of `batch_no`.
pub fn first_row_of(batch_no: u32, rows_per_batch: u32) -> u64 {
  u64::from(batch_no.saturating_sub(1)) * u64::from(rows_per_batch) + 1
}

/// Cut `input` into batches of at most `rows_per_batch` rows. Records are
/// re-encoded, so quoting in the output is normalised but field values are
/// unchanged.
pub fn split_batches(input: &[u8], rows_per_batch: u32) -> Result<Vec<Batch>> {
  let per = u64::from(rows_per_batch.max(1));
  let mut reader = data_reader(input, true);
  let header = reader.byte_headers()?.clone();

  let mut batches = Vec::new();
  let mut writer: Option<csv::Writer<Vec<u8>>> = None;
  let mut rows_in_batch = 0u64;
  let mut row_no = 0u64;
  let mut record = csv::ByteRecord::new();

  while reader.read_byte_record(&mut record)? {
    row_no += 1;
    if writer.is_none() {
      let mut w = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
      if batches.is_empty() {
        w.write_byte_record(&header)?;
      }
      writer = Some(w);
    }
    if let Some(w) = writer.as_mut() {
      w.write_byte_record(&record)?;
    }
    rows_in_batch += 1;

    if rows_in_batch == per
      && let Some(w) = writer.take()
    {
      batches.push(finish(w, batches.len(), row_no, rows_in_batch)?);
      rows_in_batch = 0;
    }
  }
  if let Some(w) = writer.take() {
    batches.push(finish(w, batches.len(), row_no, rows_in_batch)?);
  }
  Ok(batches)
}

fn finish(
  writer: csv::Writer<Vec<u8>>,
  existing: usize,
  last_row: u64,
  rows: u64,
) -> Result<Batch> {
  Ok(Batch {
    batch_no: u32::try_from(existing + 1).unwrap_or(u32::MAX),
    first_row: last_row + 1 - rows,
    rows,
    data: writer.into_inner()?,
  })
}
