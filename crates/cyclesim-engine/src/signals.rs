//! Cross-platform OS signal handling.
//!
//! [`wait_for_shutdown_signal`] completes when the process receives a
//! termination signal; [`interrupt_on`] turns that into an interrupt of the
//! running controller.
//!
//! ## Signals
//! **Unix platforms:**
//! - `SIGINT` (Ctrl-C in terminal)
//! - `SIGTERM` (default kill signal, used by systemd/Kubernetes)
//! - `SIGQUIT` (quit signal)
//!
//! **Windows platforms:**
//! - `Ctrl-C` via [`tokio::signal::ctrl_c`]

use std::future::Future;
use std::sync::Arc;

use cyclesim_core::ShutdownCoordinator;
use tracing::{error, info, warn};

/// Waits for a termination signal.
///
/// Returns `Ok(())` when any signal is received, or `Err` if signal
/// registration fails.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for a termination signal.
///
/// Returns `Ok(())` when any signal is received, or `Err` if signal
/// registration fails.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Wait for `trigger`, then interrupt the controller and hold until its
/// teardown has finished.
///
/// The blocking rendezvous runs on the blocking pool so the runtime keeps
/// serving other tasks.
pub async fn interrupt_on<F>(trigger: F, coordinator: Arc<ShutdownCoordinator>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match trigger.await {
        Ok(()) => {
            warn!("termination signal received; interrupting the simulation");
            let rendezvous = tokio::task::spawn_blocking(move || coordinator.request_interrupt());
            match rendezvous.await {
                Ok(()) => info!("simulation teardown finished after interrupt"),
                Err(e) => error!(error = %e, "interrupt rendezvous failed"),
            }
        }
        Err(e) => error!(error = %e, "failed to install signal handlers; interrupts disabled"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_interrupts_and_waits_for_teardown() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let task = tokio::spawn(interrupt_on(async { Ok(()) }, Arc::clone(&coordinator)));

        while !coordinator.is_shutdown_requested() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        coordinator.mark_terminated();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator.captured_fault().is_none());
    }

    #[tokio::test]
    async fn failed_registration_leaves_the_run_alone() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        interrupt_on(
            async { Err(std::io::Error::other("no signals here")) },
            Arc::clone(&coordinator),
        )
        .await;
        assert!(!coordinator.is_shutdown_requested());
    }
}
