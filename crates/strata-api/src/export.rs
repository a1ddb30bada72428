//! Streaming CSV export.
//!
//! Rows are read from the store in keyset chunks on a spawned task and
//! written to the response body as they arrive, so the full result set is
//! never held in memory. The whole export shares one deadline, covering store
//! reads and writes to a client that has stopped reading alike; when it passes
//! the body ends and the client sees a truncated transfer.

use std::{io, sync::Arc};

use axum::{
  body::Body,
  http::header,
  response::{IntoResponse, Response},
};
use bytes::Bytes;
use strata_core::{dimension::SubjectMeta, query::ObservationQuery, store::StatStore};
use strata_csv::ExportWriter;
use tokio::{
  sync::mpsc,
  time::{Instant, timeout_at},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::{QueryConfig, error::ApiError};

type Chunk = Result<Bytes, io::Error>;

/// Start streaming every row matching `query` as CSV.
///
/// The header is encoded up front so an encoder failure is still a proper
/// error response rather than a broken body.
pub fn stream_csv<S>(
  store: Arc<S>,
  meta: SubjectMeta,
  query: ObservationQuery,
  config: &QueryConfig,
) -> Result<Response, ApiError>
where
  S: StatStore + 'static,
{
  let writer = ExportWriter::new(&meta, &query.indicators);
  let header_line = Bytes::from(writer.header()?);

  let (tx, rx) = mpsc::channel::<Chunk>(4);
  let deadline = Instant::now() + config.export_timeout();
  let chunk_size = config.export_chunk_size.max(1);
  let subject_id = meta.subject.subject_id;

  tokio::spawn(async move {
    if send_before(&tx, deadline, Ok(header_line)).await.is_err() {
      return;
    }

    let mut cursor = None;
    let mut sent = 0usize;
    loop {
      let chunk = match timeout_at(deadline, store.stream_observations(&query, cursor, chunk_size)).await {
        Ok(Ok(chunk)) => chunk,
        Ok(Err(e)) => {
          error!(%subject_id, error = %e, "export read failed");
          let _ = send_before(&tx, deadline, Err(io::Error::other(e.to_string()))).await;
          return;
        }
        Err(_) => {
          warn!(%subject_id, rows = sent, "export timed out");
          let _ = tx.try_send(Err(io::Error::new(io::ErrorKind::TimedOut, "export timed out")));
          return;
        }
      };

      if !chunk.rows.is_empty() {
        let encoded = match writer.rows(&chunk.rows) {
          Ok(bytes) => bytes,
          Err(e) => {
            error!(%subject_id, error = %e, "export encode failed");
            let _ = send_before(&tx, deadline, Err(io::Error::other(e.to_string()))).await;
            return;
          }
        };
        sent += chunk.rows.len();
        match send_before(&tx, deadline, Ok(Bytes::from(encoded))).await {
          Ok(()) => {}
          Err(Stalled::Closed) => {
            debug!(%subject_id, rows = sent, "export abandoned by client");
            return;
          }
          Err(Stalled::TimedOut) => {
            warn!(%subject_id, rows = sent, "export timed out waiting for the client");
            return;
          }
        }
      }

      match chunk.next_cursor {
        Some(next) => cursor = Some(next),
        None => break,
      }
    }
    debug!(%subject_id, rows = sent, "export finished");
  });

  let body = Body::from_stream(ReceiverStream::new(rx));
  Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body).into_response())
}

#[derive(Debug, PartialEq, Eq)]
enum Stalled {
  /// The receiver is gone: the client hung up.
  Closed,
  /// The channel stayed full until the deadline.
  TimedOut,
}

async fn send_before(tx: &mpsc::Sender<Chunk>, deadline: Instant, chunk: Chunk) -> Result<(), Stalled> {
  match timeout_at(deadline, tx.send(chunk)).await {
    Ok(Ok(())) => Ok(()),
    Ok(Err(_)) => Err(Stalled::Closed),
    Err(_) => Err(Stalled::TimedOut),
  }
}
