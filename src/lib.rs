pub(crate) mod core;
pub mod db;
pub mod queue;
pub mod services;
pub mod store;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::{config::Settings, redis::RedisHandle, state::AppState, telemetry};
use crate::queue::memory::InMemoryTaskQueue;
use crate::queue::redis::RedisTaskQueue;
use crate::queue::TaskQueue;
use crate::store::postgres::PgCorrectionStore;

pub use crate::services::dispatcher::{Dispatcher, SubmitError, TaskHandle};
pub use crate::store::EssayStatusView;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let (queue, redis): (Arc<dyn TaskQueue>, Option<RedisHandle>) =
        match settings.redis().redis_url() {
            Some(url) => {
                let redis = RedisHandle::new(url);
                redis.connect().await?;
                tracing::info!("Redis connected successfully");
                (Arc::new(RedisTaskQueue::new(redis.clone())), Some(redis))
            }
            None => {
                tracing::warn!("Redis not configured; using in-memory task queue");
                (Arc::new(InMemoryTaskQueue::new()), None)
            }
        };

    let store = Arc::new(PgCorrectionStore::new(db_pool));
    let state = AppState::new(settings, store, queue);

    let result = tasks::scheduler::run(state).await;

    if let Some(redis) = redis {
        redis.disconnect().await;
        tracing::info!("Redis disconnected");
    }

    result
}
