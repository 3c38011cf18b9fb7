use anyhow::{Context, Result};

use crate::core::state::AppState;
use crate::core::time::{minus_secs, primitive_now_utc as now_primitive};
use crate::queue::TaskQueue;
use crate::store::CorrectionStore;

const SWEEP_BATCH: i64 = 100;

/// Extra slack on top of the lease timeout before an in-progress task is
/// treated as abandoned by a crashed worker.
const STALE_GRACE_SECS: u64 = 120;

/// Re-enqueue `pending` tasks that have sat past the orphan threshold with no
/// queue entry to show for it (the enqueue after task creation is not
/// transactional). Duplicate queue entries are harmless: delivery is
/// idempotent.
pub(crate) async fn requeue_orphaned_pending(state: &AppState) -> Result<()> {
    let now = now_primitive();
    let cutoff = minus_secs(now, state.settings().worker().pending_orphan_secs);

    let ids = state
        .store()
        .list_orphaned_pending(cutoff, now, SWEEP_BATCH)
        .await
        .context("Failed to list orphaned pending tasks")?;

    let mut requeued = 0;
    for task_id in &ids {
        state.queue().enqueue(task_id).await.context("Failed to re-enqueue orphaned task")?;
        requeued += 1;
    }

    if requeued > 0 {
        tracing::info!(requeued, "Re-enqueued orphaned pending tasks");
    }
    metrics::counter!("correction_tasks_requeued_total").increment(requeued as u64);

    Ok(())
}

/// Reset `in_progress` tasks whose attempt started longer ago than the lease
/// timeout plus grace. The guarded reset leaves tasks alone if they made
/// progress between the listing and the update.
pub(crate) async fn recover_stale_in_progress(state: &AppState) -> Result<()> {
    let now = now_primitive();
    let stale_secs =
        state.settings().worker().lease_timeout_secs.saturating_add(STALE_GRACE_SECS);
    let cutoff = minus_secs(now, stale_secs);

    let ids = state
        .store()
        .list_stale_in_progress(cutoff, SWEEP_BATCH)
        .await
        .context("Failed to list stale in-progress tasks")?;

    let mut recovered = 0;
    for task_id in &ids {
        let reset = state
            .store()
            .reset_stale_to_pending(task_id, cutoff, now)
            .await
            .context("Failed to reset stale task")?;
        if reset {
            state.queue().enqueue(task_id).await.context("Failed to re-enqueue stale task")?;
            recovered += 1;
        }
    }

    if recovered > 0 {
        tracing::warn!(recovered, "Recovered stale in-progress tasks");
    }
    metrics::counter!("correction_tasks_reclaimed_total").increment(recovered as u64);

    Ok(())
}

/// Return expired queue leases to the ready queue (crashed-worker signal at
/// the queue layer).
pub(crate) async fn reclaim_queue_leases(state: &AppState) -> Result<()> {
    let reclaimed =
        state.queue().reclaim_expired().await.context("Failed to reclaim expired leases")?;

    if reclaimed > 0 {
        tracing::warn!(reclaimed, "Reclaimed expired queue leases");
    }
    metrics::counter!("queue_leases_reclaimed_total").increment(reclaimed);

    Ok(())
}
