//! An in-process [`MessageQueue`] over `VecDeque`s, with at-least-once
//! delivery and a per-queue dead-letter list.

use std::{
  collections::{HashMap, VecDeque},
  sync::{Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use strata_core::{
  message::QueueName,
  queue::{Delivery, MessageQueue},
};
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChannelQueueError {
  #[error("unknown delivery: {0}")]
  UnknownDelivery(Uuid),
}

struct Message {
  body:           serde_json::Value,
  delivery_count: u32,
}

#[derive(Default)]
struct Queues {
  ready:        HashMap<QueueName, VecDeque<Message>>,
  in_flight:    HashMap<Uuid, (QueueName, Message)>,
  dead_letters: HashMap<QueueName, Vec<Delivery>>,
}

pub struct ChannelQueue {
  queues:             Mutex<Queues>,
  notify:             Notify,
  max_delivery_count: u32,
}

impl ChannelQueue {
  pub fn new(max_delivery_count: u32) -> Self {
    Self {
      queues: Mutex::new(Queues::default()),
      notify: Notify::new(),
      max_delivery_count: max_delivery_count.max(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Queues> { self.queues.lock().unwrap_or_else(PoisonError::into_inner) }

  fn take(&self, queue: QueueName) -> Option<Delivery> {
    let mut queues = self.lock();
    let mut message = queues.ready.get_mut(&queue)?.pop_front()?;
    message.delivery_count += 1;
    let delivery = Delivery {
      delivery_id: Uuid::new_v4(),
      queue,
      body: message.body.clone(),
      delivery_count: message.delivery_count,
    };
    queues.in_flight.insert(delivery.delivery_id, (queue, message));
    Some(delivery)
  }

  /// Messages that used up their delivery budget on `queue`.
  pub fn dead_letters(&self, queue: QueueName) -> Vec<Delivery> {
    self.lock().dead_letters.get(&queue).cloned().unwrap_or_default()
  }

  pub fn in_flight(&self) -> usize { self.lock().in_flight.len() }
}

impl MessageQueue for ChannelQueue {
  type Error = ChannelQueueError;

  async fn send(&self, queue: QueueName, body: serde_json::Value) -> Result<(), ChannelQueueError> {
    self
      .lock()
      .ready
      .entry(queue)
      .or_default()
      .push_back(Message { body, delivery_count: 0 });
    self.notify.notify_waiters();
    Ok(())
  }

  async fn receive(
    &self,
    queue: QueueName,
    wait: Duration,
  ) -> Result<Option<Delivery>, ChannelQueueError> {
    let deadline = Instant::now() + wait;
    loop {
      // Register interest before checking, so a send between the check and
      // the await is not missed.
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(delivery) = self.take(queue) {
        return Ok(Some(delivery));
      }
      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return Ok(None);
      }
    }
  }

  async fn complete<'a>(&'a self, delivery: &'a Delivery) -> Result<(), ChannelQueueError> {
    self
      .lock()
      .in_flight
      .remove(&delivery.delivery_id)
      .map(|_| ())
      .ok_or(ChannelQueueError::UnknownDelivery(delivery.delivery_id))
  }

  async fn abandon(&self, delivery: Delivery) -> Result<bool, ChannelQueueError> {
    let dead = {
      let mut queues = self.lock();
      let (queue, message) = queues
        .in_flight
        .remove(&delivery.delivery_id)
        .ok_or(ChannelQueueError::UnknownDelivery(delivery.delivery_id))?;

      if message.delivery_count >= self.max_delivery_count {
        warn!(
          queue = %queue,
          delivery_count = message.delivery_count,
          "message dead-lettered"
        );
        queues.dead_letters.entry(queue).or_default().push(delivery);
        true
      } else {
        queues.ready.entry(queue).or_default().push_back(message);
        false
      }
    };
    if !dead {
      self.notify.notify_waiters();
    }
    Ok(dead)
  }

  async fn purge(&self, queue: QueueName) -> Result<usize, ChannelQueueError> {
    Ok(self.lock().ready.remove(&queue).map_or(0, |q| q.len()))
  }

  async fn len(&self, queue: QueueName) -> Result<usize, ChannelQueueError> {
    Ok(self.lock().ready.get(&queue).map_or(0, VecDeque::len))
  }
}
