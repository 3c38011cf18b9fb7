pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::{CorrectionResult, CorrectionTask, Essay};
use crate::db::types::TaskStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct NewEssay {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub language: Option<String>,
    pub submitted_at: PrimitiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewResult {
    pub id: String,
    pub total_score: f64,
    pub max_score: f64,
    pub analysis: serde_json::Value,
    pub feedback: Option<String>,
    pub model: Option<String>,
    pub produced_at: PrimitiveDateTime,
}

/// Read-only view served through the status-query boundary. Internal error
/// detail is reduced to a human-readable summary.
#[derive(Debug, Clone, Serialize)]
pub struct EssayStatusView {
    pub essay_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<CorrectionResult>,
    pub error_detail: Option<String>,
}

/// Persistence contract for the correction pipeline. Every mutation carries
/// an expected-prior-status guard; a `false`/`None` return means the
/// optimistic check lost and the caller must re-read and re-decide.
#[async_trait]
pub trait CorrectionStore: Send + Sync {
    async fn insert_essay(&self, essay: NewEssay, now: PrimitiveDateTime)
        -> Result<(), StoreError>;

    async fn find_essay(&self, essay_id: &str) -> Result<Option<Essay>, StoreError>;

    /// Insert a `pending` task unless the essay already has a non-abandoned
    /// one, then return whichever task survives.
    async fn create_task_if_absent(
        &self,
        task_id: &str,
        essay_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<CorrectionTask, StoreError>;

    async fn find_task(&self, task_id: &str) -> Result<Option<CorrectionTask>, StoreError>;

    async fn find_active_task_for_essay(
        &self,
        essay_id: &str,
    ) -> Result<Option<CorrectionTask>, StoreError>;

    /// `pending -> in_progress` with attempt increment; `None` when the
    /// guard fails (already running, terminal, or not yet retry-eligible).
    async fn begin_attempt(
        &self,
        task_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<CorrectionTask>, StoreError>;

    /// Atomically insert the result and move `in_progress -> succeeded`.
    /// Returns `false` without writing anything when the guard fails.
    async fn commit_result(&self, task_id: &str, result: NewResult) -> Result<bool, StoreError>;

    /// `in_progress -> pending` with the recorded error and a retry-eligibility
    /// timestamp.
    async fn schedule_retry(
        &self,
        task_id: &str,
        error: &str,
        next_retry_at: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;

    /// Terminal `failed` transition from any non-terminal state.
    async fn mark_failed(
        &self,
        task_id: &str,
        error: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;

    async fn find_result_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<CorrectionResult>, StoreError>;

    async fn essay_status(&self, essay_id: &str) -> Result<Option<EssayStatusView>, StoreError>;

    /// `pending` tasks past retry eligibility that have not been touched since
    /// `cutoff` — candidates for re-enqueue by the reconciliation sweep.
    async fn list_orphaned_pending(
        &self,
        cutoff: PrimitiveDateTime,
        now: PrimitiveDateTime,
        limit: i64,
    ) -> Result<Vec<String>, StoreError>;

    /// `in_progress` tasks whose last attempt started before `cutoff`
    /// (crashed-worker suspects).
    async fn list_stale_in_progress(
        &self,
        cutoff: PrimitiveDateTime,
        limit: i64,
    ) -> Result<Vec<String>, StoreError>;

    /// Guarded reset of a stale `in_progress` task back to `pending`. The
    /// cutoff is re-checked inside the update so a task that made progress in
    /// the meantime is left alone.
    async fn reset_stale_to_pending(
        &self,
        task_id: &str,
        cutoff: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;
}
