//! Periodic self-trigger loop.
//!
//! Stands in for an external cron: runs one worker invocation every
//! `interval` until shutdown is signalled. Invocations never overlap within
//! one daemon, but several daemons (or a daemon plus the HTTP trigger) may
//! run against the same database; the claim protocol keeps that safe.

use std::time::Duration;

use cadence_scheduler::{InvocationRequest, Worker};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Run invocations until `shutdown_rx` flips to `true`.
///
/// Returns the number of invocations started.
pub async fn run(
    worker: &Worker,
    request: &InvocationRequest,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> usize {
    info!(interval_secs = interval.as_secs(), "daemon starting");
    let mut invocations = 0;

    loop {
        if *shutdown_rx.borrow() {
            info!("daemon shutting down");
            break;
        }

        invocations += 1;
        match worker.run(request).await {
            Ok(response) => {
                let failed = response.results.iter().filter(|r| !r.ok).count();
                if failed > 0 {
                    warn!(
                        processed = response.processed,
                        failed, "invocation finished with failures"
                    );
                } else {
                    info!(processed = response.processed, "invocation finished");
                }
            }
            Err(e) => error!(error = %e, "invocation failed"),
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("daemon received shutdown signal");
                }
            }
            _ = sleep(interval) => {}
        }
    }

    info!(invocations, "daemon shut down gracefully");
    invocations
}
