//! The strata import pipeline.
//!
//! A submitted data file moves through a persisted status machine driven by
//! two work queues: `imports-pending` carries whole-file phases and
//! `imports-available` carries one message per batch. Handlers are
//! idempotent against at-least-once delivery; see [`coordinator`] for the
//! phases and [`recovery`] for resuming after a crash.
//!
//! ```text
//! submit ─▶ QUEUED ─▶ PROCESSING_ARCHIVE ─▶ VALIDATE_AND_IMPORT_META ─▶ SPLIT
//!                                                                      │
//!             COMPLETE ◀── FINALIZE ◀── IMPORT_OBSERVATIONS ◀── N batches
//! ```

pub mod blob;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fixtures;
pub mod observations;
pub mod queue;
pub mod recovery;
pub mod splitter;
pub mod worker;

#[cfg(test)]
mod tests;

use std::sync::Arc;

pub use blob::{FsBlobStore, MemoryBlobStore};
pub use cache::{DimensionCache, Dimensions};
pub use config::ImporterConfig;
pub use coordinator::{Coordinator, ImportProgress, SubmitRequest};
pub use error::{Error, Result};
pub use queue::ChannelQueue;
pub use recovery::{RecoveryAction, RecoveryHandler, RecoveryReport};
use strata_core::{blob::BlobStore, queue::MessageQueue, store::StatStore};
use tokio::sync::RwLock;
use tracing::info;
pub use worker::{Worker, WorkerPool};

/// Everything a process needs to run imports: the coordinator, the recovery
/// handler and the gate they share with the workers.
pub struct Pipeline<S, Q, B> {
  pub coordinator: Arc<Coordinator<S, Q, B>>,
  pub recovery:    Arc<RecoveryHandler<S, Q, B>>,
  pub dimensions:  Arc<Dimensions>,
  store:           Arc<S>,
  queue:           Arc<Q>,
  gate:            recovery::Gate,
  config:          ImporterConfig,
}

impl<S, Q, B> Pipeline<S, Q, B>
where
  S: StatStore,
  Q: MessageQueue,
  B: BlobStore,
{
  pub fn new(store: Arc<S>, queue: Arc<Q>, blobs: Arc<B>, config: ImporterConfig) -> Self {
    let dimensions = Arc::new(Dimensions::default());
    let gate = Arc::new(RwLock::new(()));
    let coordinator = Arc::new(Coordinator::new(
      store.clone(),
      queue.clone(),
      blobs.clone(),
      dimensions.clone(),
      config.clone(),
    ));
    let recovery = Arc::new(RecoveryHandler::new(
      coordinator.clone(),
      store.clone(),
      queue.clone(),
      blobs,
      gate.clone(),
    ));
    Self { coordinator, recovery, dimensions, store, queue, gate, config }
  }

  pub fn queue(&self) -> &Arc<Q> { &self.queue }

  pub fn config(&self) -> &ImporterConfig { &self.config }

  /// Pre-load the location cache from the store.
  pub async fn warm(&self) -> Result<usize> {
    let warmed = self.dimensions.warm(self.store.as_ref()).await?;
    info!(locations = warmed, "dimension cache warmed");
    Ok(warmed)
  }

  pub fn worker(&self, id: usize) -> Worker<S, Q, B> {
    Worker::new(
      id,
      self.coordinator.clone(),
      self.recovery.clone(),
      self.queue.clone(),
      self.gate.clone(),
      self.config.poll_interval(),
    )
  }

  /// Handle messages on the calling task until every queue is empty.
  /// Returns how many were handled.
  pub async fn run_until_idle(&self) -> Result<usize> {
    let worker = self.worker(0);
    let mut handled = 0;
    while worker.tick(std::time::Duration::ZERO).await? {
      handled += 1;
    }
    Ok(handled)
  }
}

impl<S, Q, B> Pipeline<S, Q, B>
where
  S: StatStore + 'static,
  Q: MessageQueue + 'static,
  B: BlobStore + 'static,
{
  pub fn spawn_workers(&self) -> WorkerPool {
    let count = self.config.workers.max(1);
    info!(workers = count, "starting import workers");
    WorkerPool::spawn((0..count).map(|id| self.worker(id)))
  }
}
