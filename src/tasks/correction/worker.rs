use anyhow::{Context, Result};
use serde_json::json;
use uuid::Uuid;

use crate::core::backoff::{backoff_delay, RetryPolicy};
use crate::core::state::AppState;
use crate::core::time::{format_primitive, plus_std, primitive_now_utc as now_primitive};
use crate::db::models::CorrectionTask;
use crate::queue::{Delivery, TaskQueue};
use crate::services::scoring::{ScoreRequest, ScoringClient, ScoringError};
use crate::store::{CorrectionStore, NewResult};

/// Execute one queue delivery end to end. Every path settles the delivery
/// with an ack or a nack; duplicate deliveries of terminal tasks are acked
/// without executing anything.
pub(crate) async fn process_delivery(
    state: &AppState,
    scorer: &dyn ScoringClient,
    delivery: &Delivery,
) -> Result<()> {
    let task_id = delivery.task_id.as_str();

    let Some(task) =
        state.store().find_task(task_id).await.context("Failed to load correction task")?
    else {
        tracing::warn!(task_id, "Delivery references unknown task; discarding");
        ack(state, delivery).await;
        return Ok(());
    };

    if task.status.is_terminal() {
        tracing::info!(task_id, status = ?task.status, "Skipping terminal task redelivery");
        metrics::counter!("correction_jobs_total", "status" => "skipped").increment(1);
        ack(state, delivery).await;
        return Ok(());
    }

    let now = now_primitive();
    let Some(task) =
        state.store().begin_attempt(task_id, now).await.context("Failed to begin attempt")?
    else {
        // Lost the optimistic race (another delivery runs the task, or the
        // retry delay has not elapsed). Re-read and re-decide instead of
        // repeating the same mutation.
        return redecide(state, delivery).await;
    };

    execute_attempt(state, scorer, delivery, task).await
}

async fn execute_attempt(
    state: &AppState,
    scorer: &dyn ScoringClient,
    delivery: &Delivery,
    task: CorrectionTask,
) -> Result<()> {
    let task_id = task.id.as_str();
    let started_at = task.last_attempt_at.unwrap_or_else(now_primitive);
    let queue_latency = (started_at.assume_utc() - task.created_at.assume_utc()).as_seconds_f64();

    let Some(essay) =
        state.store().find_essay(&task.essay_id).await.context("Failed to load essay")?
    else {
        // The essay row is gone; retrying can never succeed.
        let reason = "Essay content is no longer available";
        state
            .store()
            .mark_failed(task_id, reason, now_primitive())
            .await
            .context("Failed to mark task failed")?;
        metrics::counter!("correction_jobs_total", "status" => "failed").increment(1);
        ack(state, delivery).await;
        return Ok(());
    };

    let max_score = state.settings().ai().ai_max_score;
    let request = ScoreRequest {
        essay_id: essay.id.clone(),
        content: essay.content,
        language: essay.language,
        rubric: json!({
            "criteria": "Assess using the criteria in the system prompt",
            "total_max_score": max_score,
        }),
        max_score,
    };

    match scorer.score(request).await {
        Ok(report) => {
            let produced_at = now_primitive();
            let duration =
                (produced_at.assume_utc() - started_at.assume_utc()).as_seconds_f64();

            let committed = state
                .store()
                .commit_result(
                    task_id,
                    NewResult {
                        id: Uuid::new_v4().to_string(),
                        total_score: report.total_score,
                        max_score: report.max_score,
                        analysis: report.analysis,
                        feedback: report.feedback,
                        model: report.model,
                        produced_at,
                    },
                )
                .await
                .context("Failed to commit correction result")?;

            if committed {
                metrics::counter!("correction_jobs_total", "status" => "succeeded").increment(1);
                metrics::histogram!("correction_duration_seconds").record(duration);
                metrics::histogram!("correction_queue_latency_seconds").record(queue_latency);
                tracing::info!(task_id, essay_id = %task.essay_id, "Correction succeeded");
            } else {
                // A concurrent delivery won the commit; its result stands.
                metrics::counter!("correction_jobs_total", "status" => "skipped").increment(1);
                tracing::info!(task_id, "Result commit lost the race; discarding duplicate");
            }

            ack(state, delivery).await;
            Ok(())
        }
        Err(err) => handle_failure(state, delivery, &task, err).await,
    }
}

async fn handle_failure(
    state: &AppState,
    delivery: &Delivery,
    task: &CorrectionTask,
    err: ScoringError,
) -> Result<()> {
    let task_id = task.id.as_str();
    let worker = state.settings().worker();
    let attempt = task.attempt_count.max(0) as u32;
    let now = now_primitive();

    if err.is_transient() && attempt < worker.max_attempts {
        let delay = backoff_delay(attempt, RetryPolicy::from_settings(worker));
        let retry_at = plus_std(now, delay);
        state
            .store()
            .schedule_retry(task_id, &err.to_string(), retry_at, now)
            .await
            .context("Failed to schedule retry")?;

        let released = state
            .queue()
            .nack(task_id, &delivery.token, delay)
            .await
            .context("Failed to nack delivery")?;
        if !released {
            tracing::warn!(task_id, "Lease already released while scheduling retry");
        }

        metrics::counter!("correction_jobs_total", "status" => "retried").increment(1);
        tracing::warn!(
            task_id,
            attempt,
            retry_at = %format_primitive(retry_at),
            error = %err,
            "Transient scoring failure; retry scheduled"
        );
        return Ok(());
    }

    let reason = if err.is_transient() {
        format!("Retry attempts exhausted after {attempt} tries: {err}")
    } else {
        err.to_string()
    };

    state
        .store()
        .mark_failed(task_id, &reason, now)
        .await
        .context("Failed to mark task failed")?;
    metrics::counter!("correction_jobs_total", "status" => "failed").increment(1);
    tracing::error!(task_id, attempt, error = %err, "Correction failed permanently");

    ack(state, delivery).await;
    Ok(())
}

async fn redecide(state: &AppState, delivery: &Delivery) -> Result<()> {
    let task_id = delivery.task_id.as_str();
    let task = state.store().find_task(task_id).await.context("Failed to re-read task")?;

    match task {
        Some(task) if !task.status.is_terminal() => {
            // Someone else holds the task, or the retry delay is still
            // running; hand the delivery back with a short pause.
            let delay = std::time::Duration::from_secs(state.settings().worker().poll_interval_secs);
            let released = state
                .queue()
                .nack(task_id, &delivery.token, delay)
                .await
                .context("Failed to nack delivery")?;
            if !released {
                tracing::warn!(task_id, "Lease already released during re-decide");
            }
        }
        _ => {
            metrics::counter!("correction_jobs_total", "status" => "skipped").increment(1);
            ack(state, delivery).await;
        }
    }

    Ok(())
}

async fn ack(state: &AppState, delivery: &Delivery) {
    match state.queue().ack(&delivery.task_id, &delivery.token).await {
        Ok(true) => {}
        Ok(false) => {
            // Lease expired mid-flight and was reclaimed; the terminal-state
            // check makes the redelivery a no-op.
            tracing::warn!(task_id = %delivery.task_id, "Ack rejected for stale lease");
        }
        Err(err) => {
            tracing::error!(task_id = %delivery.task_id, error = %err, "Failed to ack delivery");
        }
    }
}
