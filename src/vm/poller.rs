//! Periodic reconciliation of recorded VM state against the process table.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::vm::supervisor::{Reconciliation, VmSupervisor};

/// Handle to a running poller task.
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop the loop and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            debug!(error = %e, "status poller task ended abnormally");
        }
    }
}

/// Spawn a task that calls [`VmSupervisor::reconcile`] every `interval`.
///
/// The first pass runs one full interval after spawning. A zero interval
/// is raised to one millisecond.
pub fn spawn_status_poller(supervisor: Arc<VmSupervisor>, interval: Duration) -> PollerHandle {
    let interval = interval.max(Duration::from_millis(1));
    let (shutdown, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "status poller started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match supervisor.reconcile().await {
                        Reconciliation::Unchanged => {}
                        Reconciliation::Skipped => debug!("reconcile skipped: operation in flight"),
                        other => info!(?other, state = %supervisor.state(), "reconciled VM state"),
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("status poller stopped");
    });
    PollerHandle { shutdown, task }
}
