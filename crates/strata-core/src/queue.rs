//! The work-queue seam.
//!
//! Delivery is at-least-once: a received message stays in flight until it is
//! completed, and an abandoned message is redelivered until its delivery count
//! reaches the queue's limit, after which it is dead-lettered.

use std::{future::Future, time::Duration};

use uuid::Uuid;

use crate::message::QueueName;

/// A received message, held in flight until completed or abandoned.
#[derive(Debug, Clone)]
pub struct Delivery {
  pub delivery_id:    Uuid,
  pub queue:          QueueName,
  pub body:           serde_json::Value,
  /// 1 on first delivery.
  pub delivery_count: u32,
}

pub trait MessageQueue: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn send(
    &self,
    queue: QueueName,
    body: serde_json::Value,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Wait up to `wait` for a message; `None` if the queue stayed empty.
  /// Dropping the future before it resolves must leave the queue untouched.
  fn receive(
    &self,
    queue: QueueName,
    wait: Duration,
  ) -> impl Future<Output = Result<Option<Delivery>, Self::Error>> + Send + '_;

  /// Acknowledge a delivery; it will not be seen again.
  fn complete<'a>(
    &'a self,
    delivery: &'a Delivery,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Return a delivery for redelivery, or dead-letter it if it has used up
  /// its delivery budget. Returns `true` if it was dead-lettered.
  fn abandon(
    &self,
    delivery: Delivery,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Drop every ready message on `queue`. Returns how many were removed.
  fn purge(&self, queue: QueueName) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  /// Number of ready (not in-flight) messages on `queue`.
  fn len(&self, queue: QueueName) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;
}
