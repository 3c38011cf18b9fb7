use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use tokio::sync::RwLock;

#[derive(Clone)]
pub(crate) struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

impl RedisHandle {
    pub(crate) fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub(crate) async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let mut guard = self.manager.write().await;
        *guard = Some(manager);
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        let mut guard = self.manager.write().await;
        *guard = None;
    }

    pub(crate) async fn connection(&self) -> Option<ConnectionManager> {
        self.manager.read().await.clone()
    }
}
