use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{Level, event};

use crate::config::ReplicaConfig;
use crate::connectivity::{ConnectivityMonitor, EligibilityProbe, HttpEligibilityProbe, MonitorHandle};
use crate::core::Result;
use crate::hydration::HydrationCache;
use crate::migrations::MigrationManifest;
use crate::replica::ReplicaManager;
use crate::sync::{ChangeFeed, HttpChangeFeed, Synchronizer, TrackedTable};

#[derive(Default)]
struct RuntimeTasks {
    monitor: Option<MonitorHandle>,
    recovery: Option<JoinHandle<()>>,
}

/// Owns every sync component of one replica.
///
/// Nothing here is global: build one per replica namespace and pass it to
/// whoever needs the cache or the manager.
pub struct SyncRuntime {
    manager: Arc<ReplicaManager>,
    synchronizer: Synchronizer,
    monitor: Arc<ConnectivityMonitor>,
    cache: HydrationCache,
    tables: Vec<TrackedTable>,
    tasks: Mutex<RuntimeTasks>,
}

impl SyncRuntime {
    pub fn new(
        config: ReplicaConfig,
        manifest: MigrationManifest,
        tables: Vec<TrackedTable>,
        feed: Arc<dyn ChangeFeed>,
        probe: Arc<dyn EligibilityProbe>,
    ) -> Self {
        let manager = Arc::new(ReplicaManager::new(config, manifest));
        let synchronizer = Synchronizer::new(Arc::clone(&manager), feed);
        let monitor = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&manager),
            synchronizer.clone(),
            probe,
            tables.clone(),
        ));
        let cache = HydrationCache::new(Arc::clone(&manager));

        Self {
            manager,
            synchronizer,
            monitor,
            cache,
            tables,
            tasks: Mutex::new(RuntimeTasks::default()),
        }
    }

    /// Runtime talking to the HTTP feed and status endpoints from `config`.
    pub fn http(config: ReplicaConfig, manifest: MigrationManifest, tables: Vec<TrackedTable>) -> Result<Self> {
        let feed = Arc::new(HttpChangeFeed::from_config(&config)?);
        let probe = Arc::new(HttpEligibilityProbe::from_config(&config)?);
        Ok(Self::new(config, manifest, tables, feed, probe))
    }

    pub fn manager(&self) -> &Arc<ReplicaManager> {
        &self.manager
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn cache(&self) -> &HydrationCache {
        &self.cache
    }

    pub fn tables(&self) -> &[TrackedTable] {
        &self.tables
    }

    fn tasks(&self) -> MutexGuard<'_, RuntimeTasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the background loops and initializes the replica.
    ///
    /// An initialization error is returned as is. With
    /// [`RecoveryMode::Reset`](crate::config::RecoveryMode::Reset) the wiped
    /// replica is re-initialized in the background and the cache refreshed.
    pub async fn start(&self) -> Result<()> {
        {
            let mut tasks = self.tasks();
            if tasks.recovery.as_ref().is_none_or(|task| task.is_finished()) {
                let seen = self.manager.resets().get();
                let manager = Arc::clone(&self.manager);
                let cache = self.cache.clone();
                tasks.recovery = Some(tokio::spawn(watch_resets(manager, cache, seen)));
            }
            if tasks.monitor.as_ref().is_none_or(|monitor| monitor.is_finished()) {
                tasks.monitor = Some(self.monitor.spawn());
            }
        }

        self.manager.initialize().await
    }

    /// Wipes the replica, builds it again and re-runs every subscribed
    /// hydration query against it.
    pub async fn recover(&self) -> Result<()> {
        event!(Level::WARN, "recovering replica from scratch");
        self.synchronizer.stop();
        self.cache.suspend();
        self.manager.destroy().await?;
        self.manager.initialize().await?;
        self.cache.refresh();
        Ok(())
    }

    /// Stops every loop and closes the replica, keeping durable files.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_tasks().await?;
        self.manager.close().await
    }

    /// Like [`shutdown`](Self::shutdown) but also deletes durable storage.
    pub async fn destroy(&self) -> Result<()> {
        self.stop_tasks().await?;
        self.manager.destroy().await
    }

    async fn stop_tasks(&self) -> Result<()> {
        let (monitor, recovery) = {
            let mut tasks = self.tasks();
            (tasks.monitor.take(), tasks.recovery.take())
        };
        if let Some(recovery) = recovery {
            recovery.abort();
        }
        if let Some(monitor) = monitor {
            monitor.stop().await?;
        }
        self.synchronizer.stop();
        self.cache.suspend();
        Ok(())
    }
}

/// Re-initializes after every destructive reset newer than `seen`.
async fn watch_resets(manager: Arc<ReplicaManager>, cache: HydrationCache, mut seen: u64) {
    let resets = manager.resets();
    loop {
        let Ok(count) = resets.wait_for(move |count| *count > seen).await else {
            break;
        };
        seen = count;

        match manager.initialize().await {
            Ok(()) => {
                let restarted = cache.refresh();
                event!(Level::INFO, resets = count, restarted, "replica rebuilt after reset");
            }
            Err(err) => {
                // A failed attempt may have reset again; wait for a newer one.
                event!(Level::ERROR, error = %err, "replica rebuild failed");
                seen = resets.get();
            }
        }
    }
}
