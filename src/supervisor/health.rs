//! Periodic crash detection for the supervised process.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::ProcessSupervisor;

/// Spawn the health loop. A single ticker with `MissedTickBehavior::Skip`
/// gives single-slot scheduling: a slow respawn simply delays the next
/// check instead of piling up duplicate spawn attempts.
pub(super) fn spawn_health_loop(
    supervisor: Weak<ProcessSupervisor>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(supervisor) = supervisor.upgrade() else { break };
                    // Errors stay inside the loop; the schedule must survive
                    // any failed respawn attempt.
                    if let Err(e) = supervisor.health_check().await {
                        tracing::warn!(error = %e, "sidecar respawn from health check failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::debug!("health monitor stopped");
    })
}
