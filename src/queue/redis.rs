use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use crate::core::redis::RedisHandle;

use super::{Delivery, LeaseToken, QueueError, TaskQueue};

const READY_KEY: &str = "scriba:queue:ready";
const DELAYED_KEY: &str = "scriba:queue:delayed";
const INFLIGHT_KEY: &str = "scriba:queue:inflight";
const LEASES_KEY: &str = "scriba:queue:leases";

// Promote due delayed entries, pop the oldest ready entry and record its
// lease, all in one script so a canceled caller never strands a lease.
const RESERVE_SCRIPT: &str = r#"
    local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
    for i = 1, #due do
        redis.call('LPUSH', KEYS[1], due[i])
    end
    if #due > 0 then
        redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
    end
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        return false
    end
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    redis.call('HSET', KEYS[4], id, ARGV[3])
    return id
"#;

const ACK_SCRIPT: &str = r#"
    local held = redis.call('HGET', KEYS[2], ARGV[1])
    if held ~= ARGV[2] then
        return 0
    end
    redis.call('HDEL', KEYS[2], ARGV[1])
    redis.call('ZREM', KEYS[1], ARGV[1])
    return 1
"#;

const NACK_SCRIPT: &str = r#"
    local held = redis.call('HGET', KEYS[2], ARGV[1])
    if held ~= ARGV[2] then
        return 0
    end
    redis.call('HDEL', KEYS[2], ARGV[1])
    redis.call('ZREM', KEYS[1], ARGV[1])
    redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
    return 1
"#;

const RECLAIM_SCRIPT: &str = r#"
    local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
    for i = 1, #expired do
        redis.call('ZREM', KEYS[2], expired[i])
        redis.call('HDEL', KEYS[3], expired[i])
        redis.call('LPUSH', KEYS[1], expired[i])
    end
    return #expired
"#;

pub struct RedisTaskQueue {
    redis: RedisHandle,
}

impl RedisTaskQueue {
    pub(crate) fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }

    async fn connection(&self) -> Result<ConnectionManager, QueueError> {
        self.redis.connection().await.ok_or(QueueError::NotConnected)
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task_id: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("LPUSH").arg(READY_KEY).arg(task_id).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn enqueue_delayed(&self, task_id: &str, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let due = now_ms() + delay.as_millis() as u64;
        redis::cmd("ZADD")
            .arg(DELAYED_KEY)
            .arg(due)
            .arg(task_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn reserve(&self, lease_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let now = now_ms();
        let deadline = now + lease_timeout.as_millis() as u64;
        let token = Uuid::new_v4().to_string();

        let task_id: Option<String> = Script::new(RESERVE_SCRIPT)
            .key(READY_KEY)
            .key(DELAYED_KEY)
            .key(INFLIGHT_KEY)
            .key(LEASES_KEY)
            .arg(now)
            .arg(deadline)
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        Ok(task_id.map(|task_id| Delivery { task_id, token: LeaseToken(token) }))
    }

    async fn ack(&self, task_id: &str, token: &LeaseToken) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let released: i64 = Script::new(ACK_SCRIPT)
            .key(INFLIGHT_KEY)
            .key(LEASES_KEY)
            .arg(task_id)
            .arg(&token.0)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn nack(
        &self,
        task_id: &str,
        token: &LeaseToken,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let due = now_ms() + delay.as_millis() as u64;
        let released: i64 = Script::new(NACK_SCRIPT)
            .key(INFLIGHT_KEY)
            .key(LEASES_KEY)
            .key(DELAYED_KEY)
            .arg(task_id)
            .arg(&token.0)
            .arg(due)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn reclaim_expired(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let reclaimed: i64 = Script::new(RECLAIM_SCRIPT)
            .key(READY_KEY)
            .key(INFLIGHT_KEY)
            .key(LEASES_KEY)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(reclaimed.max(0) as u64)
    }
}
