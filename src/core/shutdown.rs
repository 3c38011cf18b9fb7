use tokio::signal;

/// Resolves when the process is asked to stop (Ctrl+C, or SIGTERM on unix).
pub(crate) async fn shutdown_signal() {
    let interrupt = async {
        if signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = async {
        std::future::pending::<()>().await;
        "none"
    };

    let signal = tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    };

    tracing::info!(signal, "Shutdown signal received; draining workers");
}
