//! Termination signal wait.

use pilot_types::PilotError;

/// Resolve once SIGINT, SIGTERM or SIGQUIT arrives (Ctrl-C elsewhere).
#[cfg(unix)]
pub async fn wait_for_termination() -> Result<(), PilotError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => tracing::info!(signal = "SIGINT", "termination requested"),
        _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "termination requested"),
        _ = sigquit.recv() => tracing::info!(signal = "SIGQUIT", "termination requested"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_termination() -> Result<(), PilotError> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("termination requested");
    Ok(())
}
