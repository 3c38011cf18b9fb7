use std::sync::Arc;

use crate::core::config::Settings;
use crate::queue::TaskQueue;
use crate::store::CorrectionStore;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: Arc<dyn CorrectionStore>,
    queue: Arc<dyn TaskQueue>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        store: Arc<dyn CorrectionStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, store, queue }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn store(&self) -> &Arc<dyn CorrectionStore> {
        &self.inner.store
    }

    pub(crate) fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.inner.queue
    }
}
