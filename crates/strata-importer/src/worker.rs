//! Queue consumers.

use std::{future::Future, sync::Arc, time::Duration};

use strata_core::{
  blob::BlobStore,
  message::{ImportMessage, ImportObservationsMessage, QueueName},
  queue::{Delivery, MessageQueue},
  store::StatStore,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
  Error, Result,
  coordinator::Coordinator,
  recovery::{Gate, RecoveryHandler},
};

pub struct Worker<S, Q, B> {
  id:          usize,
  coordinator: Arc<Coordinator<S, Q, B>>,
  recovery:    Arc<RecoveryHandler<S, Q, B>>,
  queue:       Arc<Q>,
  gate:        Gate,
  poll:        Duration,
}

impl<S, Q, B> Worker<S, Q, B>
where
  S: StatStore,
  Q: MessageQueue,
  B: BlobStore,
{
  pub fn new(
    id: usize,
    coordinator: Arc<Coordinator<S, Q, B>>,
    recovery: Arc<RecoveryHandler<S, Q, B>>,
    queue: Arc<Q>,
    gate: Gate,
    poll: Duration,
  ) -> Self {
    Self { id, coordinator, recovery, queue, gate, poll }
  }

  /// Consume until `shutdown` flips to `true`. A message being handled when
  /// the signal arrives is finished first.
  pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
    info!(worker = self.id, "worker started");
    while !*shutdown.borrow() {
      // An idle tick already waited `poll` on both work queues.
      if let Err(e) = self.tick(self.poll).await {
        error!(worker = self.id, error = %e, "queue unavailable");
        tokio::select! {
          _ = shutdown.changed() => {}
          _ = tokio::time::sleep(self.poll) => {}
        }
      }
    }
    info!(worker = self.id, "worker stopped");
  }

  /// Take and handle at most one message. Recovery requests run outside the
  /// gate; work messages are received and handled while holding it for
  /// reading. Returns whether a message was handled.
  pub async fn tick(&self, wait: Duration) -> Result<bool> {
    if let Some(delivery) = self
      .queue
      .receive(QueueName::RestartImports, Duration::ZERO)
      .await
      .map_err(Error::queue)?
    {
      self.settle(delivery, |_| async { self.recovery.run().await.map(|_| ()) }).await?;
      return Ok(true);
    }

    let _shared = self.gate.read().await;
    let Some(delivery) = self.receive_work(wait).await? else {
      return Ok(false);
    };
    self.settle(delivery, |d| self.dispatch(d)).await?;
    Ok(true)
  }

  /// Whole-file phases before batches. Waits on both work queues at once, so
  /// a phase message sent mid-wait is taken as soon as it lands.
  async fn receive_work(&self, wait: Duration) -> Result<Option<Delivery>> {
    for queue in [QueueName::ImportsPending, QueueName::ImportsAvailable] {
      if let Some(delivery) = self.queue.receive(queue, Duration::ZERO).await.map_err(Error::queue)? {
        return Ok(Some(delivery));
      }
    }
    if wait.is_zero() {
      return Ok(None);
    }
    // `receive` takes nothing until it returns, so the losing branch is
    // dropped without consuming a message.
    let received = tokio::select! {
      biased;
      d = self.queue.receive(QueueName::ImportsPending, wait) => d,
      d = self.queue.receive(QueueName::ImportsAvailable, wait) => d,
    };
    received.map_err(Error::queue)
  }

  async fn dispatch(&self, delivery: Delivery) -> Result<()> {
    match delivery.queue {
      QueueName::ImportsPending => {
        let message: ImportMessage = serde_json::from_value(delivery.body)?;
        self.coordinator.handle_pending(message).await
      }
      QueueName::ImportsAvailable => {
        let message: ImportObservationsMessage = serde_json::from_value(delivery.body)?;
        self.coordinator.handle_available(message).await
      }
      QueueName::RestartImports => self.recovery.run().await.map(|_| ()),
    }
  }

  /// Run `handle` and acknowledge the delivery, or hand it back for
  /// redelivery on failure.
  async fn settle<F, Fut>(&self, delivery: Delivery, handle: F) -> Result<()>
  where
    F: FnOnce(Delivery) -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    debug!(worker = self.id, queue = %delivery.queue, count = delivery.delivery_count, "handling message");
    match handle(delivery.clone()).await {
      Ok(()) => self.queue.complete(&delivery).await.map_err(Error::queue),
      Err(e) => {
        let queue = delivery.queue;
        let count = delivery.delivery_count;
        warn!(worker = self.id, %queue, count, error = %e, "message handling failed");
        if self.queue.abandon(delivery).await.map_err(Error::queue)? {
          error!(%queue, count, error = %e, "message dead-lettered");
        }
        Ok(())
      }
    }
  }
}

/// A set of spawned workers sharing one shutdown signal.
pub struct WorkerPool {
  shutdown: watch::Sender<bool>,
  handles:  Vec<JoinHandle<()>>,
}

impl WorkerPool {
  pub fn spawn<S, Q, B>(workers: impl IntoIterator<Item = Worker<S, Q, B>>) -> Self
  where
    S: StatStore + 'static,
    Q: MessageQueue + 'static,
    B: BlobStore + 'static,
  {
    let (shutdown, rx) = watch::channel(false);
    let handles = workers
      .into_iter()
      .map(|worker| tokio::spawn(worker.run(rx.clone())))
      .collect();
    Self { shutdown, handles }
  }

  pub fn len(&self) -> usize { self.handles.len() }

  pub fn is_empty(&self) -> bool { self.handles.is_empty() }

  /// Signal every worker and wait for them to finish their current message.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    for handle in self.handles {
      if let Err(e) = handle.await {
        error!(error = %e, "worker task panicked");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use strata_core::import::ImportStatus;
  use strata_store_sqlite::SqliteStore;
  use uuid::Uuid;

  use crate::{ChannelQueue, ImporterConfig, MemoryBlobStore, Pipeline, fixtures::SeedSet};

  use super::*;

  #[tokio::test]
  async fn phase_message_sent_mid_wait_is_taken_promptly() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let queue = Arc::new(ChannelQueue::new(3));
    let pipeline =
      Pipeline::new(store, queue.clone(), Arc::new(MemoryBlobStore::new()), ImporterConfig::default());
    let record = pipeline
      .coordinator
      .submit(SeedSet::absence().submit_request(Uuid::new_v4()))
      .await
      .unwrap();
    // Hold the submit message back so the worker starts out idle.
    let held = queue.receive(QueueName::ImportsPending, Duration::ZERO).await.unwrap().unwrap();

    let worker = pipeline.worker(0);
    let started = tokio::time::Instant::now();
    let (handled, ()) = tokio::join!(worker.tick(Duration::from_secs(30)), async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      queue.send(QueueName::ImportsPending, held.body.clone()).await.unwrap();
    });

    assert!(handled.unwrap());
    assert!(started.elapsed() < Duration::from_secs(10));
    let progress = pipeline.coordinator.status(record.import_id).await.unwrap();
    assert_eq!(progress.status, ImportStatus::ProcessingArchive);
  }
}
