pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("queue backend is not connected")]
    NotConnected,
}

/// Opaque proof that the holder owns the current lease on a delivery.
/// Ack/nack with a stale token is rejected, never applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(pub(crate) String);

#[derive(Debug, Clone)]
pub struct Delivery {
    pub task_id: String,
    pub token: LeaseToken,
}

/// Durable dispatch queue for correction task identifiers. Delivery is
/// at-least-once: consumers must tolerate duplicates and rely on the store's
/// terminal-state check for idempotence.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append to the ready queue (FIFO by enqueue time).
    async fn enqueue(&self, task_id: &str) -> Result<(), QueueError>;

    /// Park the task until `delay` has elapsed, then make it ready.
    async fn enqueue_delayed(&self, task_id: &str, delay: Duration) -> Result<(), QueueError>;

    /// Atomically promote due delayed entries, pop the oldest ready entry and
    /// take an exclusive lease on it. Non-blocking; returns `None` when the
    /// queue is empty. Atomicity guarantees caller cancellation can never
    /// strand a half-taken lease.
    async fn reserve(&self, lease_timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Complete the delivery. Returns `false` when the token no longer holds
    /// the lease (expired and reclaimed, or already settled).
    async fn ack(&self, task_id: &str, token: &LeaseToken) -> Result<bool, QueueError>;

    /// Release the lease and re-park the task with the given delay.
    async fn nack(
        &self,
        task_id: &str,
        token: &LeaseToken,
        delay: Duration,
    ) -> Result<bool, QueueError>;

    /// Return expired leases to the ready queue (crashed-worker signal).
    /// Returns the number of deliveries reclaimed.
    async fn reclaim_expired(&self) -> Result<u64, QueueError>;
}
