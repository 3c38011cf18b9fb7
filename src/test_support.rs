use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use time::PrimitiveDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::core::time::{minus_secs, primitive_now_utc};
use crate::db::models::{CorrectionResult, CorrectionTask, Essay};
use crate::db::types::TaskStatus;
use crate::queue::TaskQueue;
use crate::services::scoring::{ScoreReport, ScoreRequest, ScoringClient, ScoringError};
use crate::store::{CorrectionStore, EssayStatusView, NewEssay, NewResult, StoreError};

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<AsyncMutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(AsyncMutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("SCRIBA_ENV", "test");
    std::env::set_var("SCRIBA_STRICT_CONFIG", "0");
    std::env::set_var("PROMETHEUS_ENABLED", "0");

    for key in [
        "DATABASE_URL",
        "REDIS_HOST",
        "REDIS_URL",
        "REDIS_PASSWORD",
        "WORKER_CONCURRENCY",
        "MAX_ATTEMPTS",
        "BACKOFF_BASE_SECS",
        "BACKOFF_CAP_SECS",
        "LEASE_TIMEOUT_SECS",
        "POLL_INTERVAL_SECS",
        "SWEEP_INTERVAL_SECS",
        "PENDING_ORPHAN_SECS",
        "AI_REQUEST_TIMEOUT",
        "AI_MAX_SCORE",
    ] {
        std::env::remove_var(key);
    }
}

/// AppState wired over test doubles; call under `env_lock` after
/// `set_test_env`.
pub(crate) fn build_state(store: Arc<MemoryStore>, queue: Arc<dyn TaskQueue>) -> AppState {
    let settings = Settings::load().expect("settings");
    AppState::new(settings, store, queue)
}

pub(crate) async fn insert_essay(store: &MemoryStore, essay_id: &str) {
    let now = primitive_now_utc();
    store
        .insert_essay(
            NewEssay {
                id: essay_id.to_string(),
                author_id: "author-1".to_string(),
                content: "The essay under assessment.".to_string(),
                language: None,
                submitted_at: now,
            },
            now,
        )
        .await
        .expect("insert essay");
}

pub(crate) fn ok_report(total_score: f64) -> ScoreReport {
    ScoreReport {
        total_score,
        max_score: 100.0,
        analysis: serde_json::json!({"criteria_scores": []}),
        feedback: Some("Solid argument, weak conclusion.".to_string()),
        model: Some("test-model".to_string()),
    }
}

/// Scoring double that replays a scripted sequence of outcomes. Panics when
/// called more often than scripted, which doubles as an executed-exactly-N
/// assertion.
pub(crate) struct ScriptedScorer {
    outcomes: Mutex<VecDeque<Result<ScoreReport, ScoringError>>>,
}

impl ScriptedScorer {
    pub(crate) fn new(
        outcomes: impl IntoIterator<Item = Result<ScoreReport, ScoringError>>,
    ) -> Self {
        Self { outcomes: Mutex::new(outcomes.into_iter().collect()) }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.outcomes.lock().expect("scorer lock").len()
    }
}

#[async_trait]
impl ScoringClient for ScriptedScorer {
    async fn score(&self, request: ScoreRequest) -> Result<ScoreReport, ScoringError> {
        self.outcomes
            .lock()
            .expect("scorer lock")
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected scoring call for essay {}", request.essay_id))
    }
}

/// In-memory `CorrectionStore` with the same guard semantics as the Postgres
/// implementation, including the one-active-task and one-success-per-essay
/// uniqueness rules.
pub(crate) struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    essays: HashMap<String, Essay>,
    tasks: HashMap<String, CorrectionTask>,
    results: HashMap<String, CorrectionResult>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self { inner: Mutex::new(MemoryState::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().expect("memory store lock")
    }

    pub(crate) fn backdate_updated(&self, task_id: &str, seconds: u64) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.updated_at = minus_secs(task.updated_at, seconds);
        }
    }

    pub(crate) fn backdate_last_attempt(&self, task_id: &str, seconds: u64) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(task_id) {
            if let Some(last) = task.last_attempt_at {
                task.last_attempt_at = Some(minus_secs(last, seconds));
            }
        }
    }
}

#[async_trait]
impl CorrectionStore for MemoryStore {
    async fn insert_essay(
        &self,
        essay: NewEssay,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.essays.insert(
            essay.id.clone(),
            Essay {
                id: essay.id,
                author_id: essay.author_id,
                content: essay.content,
                language: essay.language,
                submitted_at: essay.submitted_at,
                created_at: now,
            },
        );
        Ok(())
    }

    async fn find_essay(&self, essay_id: &str) -> Result<Option<Essay>, StoreError> {
        Ok(self.lock().essays.get(essay_id).cloned())
    }

    async fn create_task_if_absent(
        &self,
        task_id: &str,
        essay_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<CorrectionTask, StoreError> {
        let mut state = self.lock();

        if let Some(existing) = state
            .tasks
            .values()
            .find(|task| task.essay_id == essay_id && task.status != TaskStatus::Abandoned)
        {
            return Ok(existing.clone());
        }

        let task = CorrectionTask {
            id: task_id.to_string(),
            essay_id: essay_id.to_string(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
        };
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn find_task(&self, task_id: &str) -> Result<Option<CorrectionTask>, StoreError> {
        Ok(self.lock().tasks.get(task_id).cloned())
    }

    async fn find_active_task_for_essay(
        &self,
        essay_id: &str,
    ) -> Result<Option<CorrectionTask>, StoreError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .find(|task| task.essay_id == essay_id && task.status != TaskStatus::Abandoned)
            .cloned())
    }

    async fn begin_attempt(
        &self,
        task_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<CorrectionTask>, StoreError> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(None);
        };

        let retry_eligible = task.next_retry_at.map(|at| at <= now).unwrap_or(true);
        if task.status != TaskStatus::Pending || !retry_eligible {
            return Ok(None);
        }

        task.status = TaskStatus::InProgress;
        task.attempt_count += 1;
        task.last_attempt_at = Some(now);
        task.error_detail = None;
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn commit_result(&self, task_id: &str, result: NewResult) -> Result<bool, StoreError> {
        let mut state = self.lock();

        let Some(task) = state.tasks.get(task_id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::InProgress {
            return Ok(false);
        }
        let essay_id = task.essay_id.clone();

        let another_succeeded = state.tasks.values().any(|other| {
            other.essay_id == essay_id && other.id != task_id && other.status == TaskStatus::Succeeded
        });
        if another_succeeded || state.results.contains_key(task_id) {
            return Ok(false);
        }

        let produced_at = result.produced_at;
        state.results.insert(
            task_id.to_string(),
            CorrectionResult {
                id: result.id,
                task_id: task_id.to_string(),
                total_score: result.total_score,
                max_score: result.max_score,
                analysis: sqlx::types::Json(result.analysis),
                feedback: result.feedback,
                model: result.model,
                produced_at,
            },
        );

        let task = state.tasks.get_mut(task_id).expect("task row");
        task.status = TaskStatus::Succeeded;
        task.error_detail = None;
        task.next_retry_at = None;
        task.updated_at = produced_at;
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        task_id: &str,
        error: &str,
        next_retry_at: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::InProgress {
            return Ok(false);
        }

        task.status = TaskStatus::Pending;
        task.error_detail = Some(error.to_string());
        task.next_retry_at = Some(next_retry_at);
        task.updated_at = now;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        task_id: &str,
        error: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress) {
            return Ok(false);
        }

        task.status = TaskStatus::Failed;
        task.error_detail = Some(error.to_string());
        task.next_retry_at = None;
        task.updated_at = now;
        Ok(true)
    }

    async fn find_result_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<CorrectionResult>, StoreError> {
        Ok(self.lock().results.get(task_id).cloned())
    }

    async fn essay_status(&self, essay_id: &str) -> Result<Option<EssayStatusView>, StoreError> {
        let state = self.lock();
        let task = state
            .tasks
            .values()
            .filter(|task| task.essay_id == essay_id)
            .max_by_key(|task| task.created_at);

        let Some(task) = task else {
            return Ok(None);
        };

        let result = if task.status == TaskStatus::Succeeded {
            state.results.get(&task.id).cloned()
        } else {
            None
        };

        Ok(Some(EssayStatusView {
            essay_id: task.essay_id.clone(),
            task_id: task.id.clone(),
            status: task.status,
            result,
            error_detail: task.error_detail.clone(),
        }))
    }

    async fn list_orphaned_pending(
        &self,
        cutoff: PrimitiveDateTime,
        now: PrimitiveDateTime,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let mut candidates: Vec<&CorrectionTask> = state
            .tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Pending
                    && task.updated_at < cutoff
                    && task.next_retry_at.map(|at| at <= now).unwrap_or(true)
            })
            .collect();
        candidates.sort_by_key(|task| task.updated_at);
        Ok(candidates.into_iter().take(limit.max(0) as usize).map(|task| task.id.clone()).collect())
    }

    async fn list_stale_in_progress(
        &self,
        cutoff: PrimitiveDateTime,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let mut candidates: Vec<&CorrectionTask> = state
            .tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::InProgress
                    && task.last_attempt_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .collect();
        candidates.sort_by_key(|task| task.last_attempt_at);
        Ok(candidates.into_iter().take(limit.max(0) as usize).map(|task| task.id.clone()).collect())
    }

    async fn reset_stale_to_pending(
        &self,
        task_id: &str,
        cutoff: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(false);
        };

        let stale = task.status == TaskStatus::InProgress
            && task.last_attempt_at.map(|at| at < cutoff).unwrap_or(false);
        if !stale {
            return Ok(false);
        }

        task.status = TaskStatus::Pending;
        task.next_retry_at = None;
        task.updated_at = now;
        Ok(true)
    }
}
