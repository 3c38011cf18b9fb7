use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::core::time::primitive_now_utc;
use crate::db::types::TaskStatus;
use crate::queue::TaskQueue;
use crate::store::{CorrectionStore, EssayStatusView, StoreError};

#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("essay {0} does not exist")]
    UnknownEssay(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Accepts essay submissions from the ingestion layer and turns each into at
/// most one live correction task.
pub struct Dispatcher {
    store: Arc<dyn CorrectionStore>,
    queue: Arc<dyn TaskQueue>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn CorrectionStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Idempotent submission: while the essay has a non-abandoned task, every
    /// call returns that task's handle and enqueues nothing new.
    pub async fn submit(&self, essay_id: &str) -> Result<TaskHandle, SubmitError> {
        if self.store.find_essay(essay_id).await?.is_none() {
            return Err(SubmitError::UnknownEssay(essay_id.to_string()));
        }

        if let Some(task) = self.store.find_active_task_for_essay(essay_id).await? {
            tracing::debug!(essay_id, task_id = %task.id, "Submission deduplicated");
            return Ok(TaskHandle { task_id: task.id, status: task.status });
        }

        let task_id = Uuid::new_v4().to_string();
        let now = primitive_now_utc();
        let task = self.store.create_task_if_absent(&task_id, essay_id, now).await?;

        // Lost the creation race to a concurrent submit; the winner enqueued.
        if task.id != task_id {
            return Ok(TaskHandle { task_id: task.id, status: task.status });
        }

        // A failed enqueue leaves the task pending with no queue entry; the
        // reconciliation sweep re-enqueues it after the orphan threshold.
        if let Err(err) = self.queue.enqueue(&task.id).await {
            tracing::warn!(essay_id, task_id = %task.id, error = %err, "Enqueue failed; task left pending for reconciliation");
            metrics::counter!("correction_enqueue_failures_total").increment(1);
        } else {
            tracing::info!(essay_id, task_id = %task.id, "Correction task enqueued");
            metrics::counter!("correction_tasks_submitted_total").increment(1);
        }

        Ok(TaskHandle { task_id: task.id, status: task.status })
    }

    /// Status-query boundary: latest committed task state for the essay, with
    /// the result attached once the task has succeeded.
    pub async fn status(&self, essay_id: &str) -> Result<Option<EssayStatusView>, StoreError> {
        self.store.essay_status(essay_id).await
    }
}
