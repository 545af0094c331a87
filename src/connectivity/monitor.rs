use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

use super::probe::{Eligibility, EligibilityProbe};
use crate::core::{Result, SyncError};
use crate::replica::ReplicaManager;
use crate::sync::{Synchronizer, TrackedTable};

/// What one monitor tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    SkippedSyncActive,
    Offline,
    NotEligible,
    Synced,
    SyncFailed(SyncError),
}

/// Polls reachability and eligibility and starts the synchronizer when
/// both hold.
pub struct ConnectivityMonitor {
    manager: Arc<ReplicaManager>,
    synchronizer: Synchronizer,
    probe: Arc<dyn EligibilityProbe>,
    tables: Arc<[TrackedTable]>,
}

impl ConnectivityMonitor {
    pub fn new(
        manager: Arc<ReplicaManager>,
        synchronizer: Synchronizer,
        probe: Arc<dyn EligibilityProbe>,
        tables: Vec<TrackedTable>,
    ) -> Self {
        Self {
            manager,
            synchronizer,
            probe,
            tables: tables.into(),
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        if self.synchronizer.is_active() {
            return TickOutcome::SkippedSyncActive;
        }

        let eligibility = match self.probe.check().await {
            Ok(eligibility) => eligibility,
            Err(err) => {
                event!(Level::WARN, error = %err, "eligibility probe failed, replica offline");
                self.manager.set_offline(true);
                return TickOutcome::Offline;
            }
        };

        let user_id = match eligibility {
            Eligibility {
                can_sync: true,
                user_id: Some(user_id),
            } => user_id,
            Eligibility { can_sync: true, .. } => {
                event!(Level::WARN, "eligible response without a user id");
                return TickOutcome::NotEligible;
            }
            Eligibility { can_sync: false, .. } => return TickOutcome::NotEligible,
        };

        self.manager.set_offline(false);
        match self.synchronizer.start(&self.tables, &user_id).await {
            Ok(()) => TickOutcome::Synced,
            Err(err) => {
                event!(Level::WARN, error = %err, "sync start failed");
                // A replica torn down mid-start has no connectivity to report.
                if err.is_transient() && self.manager.is_ready() {
                    self.manager.set_offline(true);
                }
                TickOutcome::SyncFailed(err)
            }
        }
    }

    /// Runs `tick` every poll interval once the replica is ready. A restart
    /// signal from the synchronizer cuts the wait short.
    pub fn spawn(self: &Arc<Self>) -> MonitorHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let monitor = Arc::clone(self);
        let restart = monitor.synchronizer.restart_signal();
        let interval = monitor.manager.config().poll_interval;

        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    ready = monitor.manager.wait_until_ready() => {
                        if ready.is_err() {
                            break;
                        }
                    }
                }

                let outcome = tokio::select! {
                    _ = &mut stop_rx => break,
                    outcome = monitor.tick() => outcome,
                };
                event!(Level::DEBUG, outcome = ?outcome, "connectivity tick");

                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = sleep(interval) => {}
                    _ = restart.notified() => {
                        event!(Level::DEBUG, "sync restart requested");
                    }
                }
            }
        });

        MonitorHandle {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}

/// Background monitor loop.
pub struct MonitorHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signals the loop to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| SyncError::Engine(format!("monitor join: {}", err)))?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(|join_handle| join_handle.is_finished())
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
