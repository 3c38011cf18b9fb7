use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Delivery, LeaseToken, QueueError, TaskQueue};

/// Queue backend with the same reserve/ack/nack/reclaim semantics as the
/// Redis one, kept in process memory. Used when Redis is not configured and
/// by the test suite; offers durability only for the process lifetime.
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    delayed: Vec<(Instant, String)>,
    leases: HashMap<String, Lease>,
}

struct Lease {
    token: String,
    deadline: Instant,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self { state: Mutex::new(QueueState::default()) }
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, task_id) = self.delayed.swap_remove(index);
                self.ready.push_back(task_id);
            } else {
                index += 1;
            }
        }
    }

    fn release(&mut self, task_id: &str, token: &LeaseToken) -> bool {
        match self.leases.get(task_id) {
            Some(lease) if lease.token == token.0 => {
                self.leases.remove(task_id);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.ready.push_back(task_id.to_string());
        Ok(())
    }

    async fn enqueue_delayed(&self, task_id: &str, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.delayed.push((Instant::now() + delay, task_id.to_string()));
        Ok(())
    }

    async fn reserve(&self, lease_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.promote_due(now);

        let Some(task_id) = state.ready.pop_front() else {
            return Ok(None);
        };

        let token = Uuid::new_v4().to_string();
        state
            .leases
            .insert(task_id.clone(), Lease { token: token.clone(), deadline: now + lease_timeout });

        Ok(Some(Delivery { task_id, token: LeaseToken(token) }))
    }

    async fn ack(&self, task_id: &str, token: &LeaseToken) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.release(task_id, token))
    }

    async fn nack(
        &self,
        task_id: &str,
        token: &LeaseToken,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if !state.release(task_id, token) {
            return Ok(false);
        }
        state.delayed.push((Instant::now() + delay, task_id.to_string()));
        Ok(true)
    }

    async fn reclaim_expired(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired: Vec<String> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(task_id, _)| task_id.clone())
            .collect();

        for task_id in &expired {
            state.leases.remove(task_id);
            state.ready.push_back(task_id.clone());
        }

        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn reserve_is_fifo() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue("t1").await.unwrap();
        queue.enqueue("t2").await.unwrap();

        let first = queue.reserve(LEASE).await.unwrap().expect("first delivery");
        let second = queue.reserve(LEASE).await.unwrap().expect("second delivery");
        assert_eq!(first.task_id, "t1");
        assert_eq!(second.task_id, "t2");
        assert!(queue.reserve(LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_requires_matching_token() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue("t1").await.unwrap();

        let delivery = queue.reserve(LEASE).await.unwrap().expect("delivery");
        let stale = LeaseToken("not-the-token".to_string());
        assert!(!queue.ack("t1", &stale).await.unwrap());
        assert!(queue.ack("t1", &delivery.token).await.unwrap());
        assert!(!queue.ack("t1", &delivery.token).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_entry_is_invisible_until_due() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue_delayed("t1", Duration::from_secs(10)).await.unwrap();

        assert!(queue.reserve(LEASE).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        let delivery = queue.reserve(LEASE).await.unwrap().expect("delivery after delay");
        assert_eq!(delivery.task_id, "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn nack_reparks_with_delay() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue("t1").await.unwrap();

        let delivery = queue.reserve(LEASE).await.unwrap().expect("delivery");
        assert!(queue.nack("t1", &delivery.token, Duration::from_secs(5)).await.unwrap());
        assert!(queue.reserve(LEASE).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let redelivery = queue.reserve(LEASE).await.unwrap().expect("redelivery");
        assert_eq!(redelivery.task_id, "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_reclaimed_and_old_token_rejected() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue("t1").await.unwrap();

        let delivery = queue.reserve(Duration::from_secs(30)).await.unwrap().expect("delivery");

        // Before expiry nothing is reclaimable and the task stays invisible.
        assert_eq!(queue.reclaim_expired().await.unwrap(), 0);
        assert!(queue.reserve(LEASE).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(queue.reclaim_expired().await.unwrap(), 1);

        let redelivery = queue.reserve(LEASE).await.unwrap().expect("redelivery");
        assert_eq!(redelivery.task_id, "t1");
        assert!(!queue.ack("t1", &delivery.token).await.unwrap());
        assert!(queue.ack("t1", &redelivery.token).await.unwrap());
    }
}
