use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, sleep};

use crate::core::state::AppState;
use crate::queue::TaskQueue;
use crate::services::scoring::{OpenAiScoringClient, ScoringClient};
use crate::tasks::correction;

const LEASE_RECLAIM_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) async fn run(state: AppState) -> Result<()> {
    let scorer: Arc<dyn ScoringClient> =
        Arc::new(OpenAiScoringClient::from_settings(state.settings())?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let concurrency = state.settings().worker().concurrency;
    let mut handles = Vec::with_capacity(concurrency + 2);

    for _ in 0..concurrency {
        handles.push(tokio::spawn(correction_worker(
            state.clone(),
            scorer.clone(),
            shutdown_rx.clone(),
        )));
    }

    handles.push(tokio::spawn(reconciliation_loop(state.clone(), shutdown_rx.clone())));
    handles.push(tokio::spawn(lease_reclaim_loop(state.clone(), shutdown_rx.clone())));

    tracing::info!(
        workers = concurrency,
        environment = %state.settings().runtime().environment.as_str(),
        "Correction pipeline running"
    );

    crate::core::shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn correction_worker(
    state: AppState,
    scorer: Arc<dyn ScoringClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let lease = Duration::from_secs(state.settings().worker().lease_timeout_secs);
    let poll = Duration::from_secs(state.settings().worker().poll_interval_secs);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match state.queue().reserve(lease).await {
            Ok(Some(delivery)) => {
                if let Err(err) =
                    correction::process_delivery(&state, scorer.as_ref(), &delivery).await
                {
                    // The delivery may still be leased; hand it back so the
                    // task is redelivered without waiting for lease expiry.
                    if let Err(nack_err) =
                        state.queue().nack(&delivery.task_id, &delivery.token, poll).await
                    {
                        tracing::error!(
                            task_id = %delivery.task_id,
                            error = %nack_err,
                            "Failed to release delivery after worker error"
                        );
                    }
                    tracing::error!(
                        task_id = %delivery.task_id,
                        error = %err,
                        "Failed to process correction delivery"
                    );
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => tracing::error!(error = %err, "Failed to reserve correction task"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(poll) => {}
        }
    }
}

async fn reconciliation_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick =
        interval(Duration::from_secs(state.settings().worker().sweep_interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = correction::requeue_orphaned_pending(&state).await {
                    tracing::error!(error = %err, "requeue_orphaned_pending failed");
                }
                if let Err(err) = correction::recover_stale_in_progress(&state).await {
                    tracing::error!(error = %err, "recover_stale_in_progress failed");
                }
            }
        }
    }
}

async fn lease_reclaim_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(LEASE_RECLAIM_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = correction::reclaim_queue_leases(&state).await {
                    tracing::error!(error = %err, "reclaim_queue_leases failed");
                }
            }
        }
    }
}
