use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::{CorrectionResult, CorrectionTask, Essay};
use crate::db::types::TaskStatus;

use super::{CorrectionStore, EssayStatusView, NewEssay, NewResult, StoreError};

const TASK_COLUMNS: &str = "\
    id, essay_id, status, attempt_count, last_attempt_at, next_retry_at, error_detail, \
    created_at, updated_at";

const RESULT_COLUMNS: &str =
    "id, task_id, total_score, max_score, analysis, feedback, model, produced_at";

pub struct PgCorrectionStore {
    pool: PgPool,
}

impl PgCorrectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CorrectionStore for PgCorrectionStore {
    async fn insert_essay(
        &self,
        essay: NewEssay,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO essays (id, author_id, content, language, submitted_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&essay.id)
        .bind(&essay.author_id)
        .bind(&essay.content)
        .bind(&essay.language)
        .bind(essay.submitted_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_essay(&self, essay_id: &str) -> Result<Option<Essay>, StoreError> {
        let essay = sqlx::query_as::<_, Essay>(
            "SELECT id, author_id, content, language, submitted_at, created_at
             FROM essays
             WHERE id = $1",
        )
        .bind(essay_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(essay)
    }

    async fn create_task_if_absent(
        &self,
        task_id: &str,
        essay_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<CorrectionTask, StoreError> {
        sqlx::query(
            "INSERT INTO correction_tasks (id, essay_id, status, attempt_count, created_at, updated_at)
             VALUES ($1, $2, $3, 0, $4, $4)
             ON CONFLICT (essay_id) WHERE status <> 'abandoned' DO NOTHING",
        )
        .bind(task_id)
        .bind(essay_id)
        .bind(TaskStatus::Pending)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let task = sqlx::query_as::<_, CorrectionTask>(&format!(
            "SELECT {TASK_COLUMNS}
             FROM correction_tasks
             WHERE essay_id = $1 AND status <> $2"
        ))
        .bind(essay_id)
        .bind(TaskStatus::Abandoned)
        .fetch_one(&self.pool)
        .await?;

        Ok(task)
    }

    async fn find_task(&self, task_id: &str) -> Result<Option<CorrectionTask>, StoreError> {
        let task = sqlx::query_as::<_, CorrectionTask>(&format!(
            "SELECT {TASK_COLUMNS}
             FROM correction_tasks
             WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn find_active_task_for_essay(
        &self,
        essay_id: &str,
    ) -> Result<Option<CorrectionTask>, StoreError> {
        let task = sqlx::query_as::<_, CorrectionTask>(&format!(
            "SELECT {TASK_COLUMNS}
             FROM correction_tasks
             WHERE essay_id = $1 AND status <> $2"
        ))
        .bind(essay_id)
        .bind(TaskStatus::Abandoned)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn begin_attempt(
        &self,
        task_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<CorrectionTask>, StoreError> {
        let task = sqlx::query_as::<_, CorrectionTask>(&format!(
            "UPDATE correction_tasks
             SET status = $1,
                 attempt_count = attempt_count + 1,
                 last_attempt_at = $2,
                 error_detail = NULL,
                 updated_at = $2
             WHERE id = $3
               AND status = $4
               AND (next_retry_at IS NULL OR next_retry_at <= $2)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(TaskStatus::InProgress)
        .bind(now)
        .bind(task_id)
        .bind(TaskStatus::Pending)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn commit_result(&self, task_id: &str, result: NewResult) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE correction_tasks
             SET status = $1,
                 error_detail = NULL,
                 next_retry_at = NULL,
                 updated_at = $2
             WHERE id = $3 AND status = $4",
        )
        .bind(TaskStatus::Succeeded)
        .bind(result.produced_at)
        .bind(task_id)
        .bind(TaskStatus::InProgress)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO correction_results
                 (id, task_id, total_score, max_score, analysis, feedback, model, produced_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&result.id)
        .bind(task_id)
        .bind(result.total_score)
        .bind(result.max_score)
        .bind(Json(result.analysis))
        .bind(&result.feedback)
        .bind(&result.model)
        .bind(result.produced_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        task_id: &str,
        error: &str,
        next_retry_at: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE correction_tasks
             SET status = $1,
                 error_detail = $2,
                 next_retry_at = $3,
                 updated_at = $4
             WHERE id = $5 AND status = $6",
        )
        .bind(TaskStatus::Pending)
        .bind(error)
        .bind(next_retry_at)
        .bind(now)
        .bind(task_id)
        .bind(TaskStatus::InProgress)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        task_id: &str,
        error: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE correction_tasks
             SET status = $1,
                 error_detail = $2,
                 next_retry_at = NULL,
                 updated_at = $3
             WHERE id = $4 AND status IN ($5, $6)",
        )
        .bind(TaskStatus::Failed)
        .bind(error)
        .bind(now)
        .bind(task_id)
        .bind(TaskStatus::Pending)
        .bind(TaskStatus::InProgress)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn find_result_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<CorrectionResult>, StoreError> {
        let result = sqlx::query_as::<_, CorrectionResult>(&format!(
            "SELECT {RESULT_COLUMNS}
             FROM correction_results
             WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }

    async fn essay_status(&self, essay_id: &str) -> Result<Option<EssayStatusView>, StoreError> {
        let task = sqlx::query_as::<_, CorrectionTask>(&format!(
            "SELECT {TASK_COLUMNS}
             FROM correction_tasks
             WHERE essay_id = $1
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(essay_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(task) = task else {
            return Ok(None);
        };

        let result = if task.status == TaskStatus::Succeeded {
            self.find_result_for_task(&task.id).await?
        } else {
            None
        };

        Ok(Some(EssayStatusView {
            essay_id: task.essay_id,
            task_id: task.id,
            status: task.status,
            result,
            error_detail: task.error_detail,
        }))
    }

    async fn list_orphaned_pending(
        &self,
        cutoff: PrimitiveDateTime,
        now: PrimitiveDateTime,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id
             FROM correction_tasks
             WHERE status = $1
               AND updated_at < $2
               AND (next_retry_at IS NULL OR next_retry_at <= $3)
             ORDER BY updated_at
             LIMIT $4",
        )
        .bind(TaskStatus::Pending)
        .bind(cutoff)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_stale_in_progress(
        &self,
        cutoff: PrimitiveDateTime,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id
             FROM correction_tasks
             WHERE status = $1
               AND last_attempt_at IS NOT NULL
               AND last_attempt_at < $2
             ORDER BY last_attempt_at
             LIMIT $3",
        )
        .bind(TaskStatus::InProgress)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn reset_stale_to_pending(
        &self,
        task_id: &str,
        cutoff: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE correction_tasks
             SET status = $1,
                 next_retry_at = NULL,
                 updated_at = $2
             WHERE id = $3
               AND status = $4
               AND last_attempt_at IS NOT NULL
               AND last_attempt_at < $5",
        )
        .bind(TaskStatus::Pending)
        .bind(now)
        .bind(task_id)
        .bind(TaskStatus::InProgress)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }
}
