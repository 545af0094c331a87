use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

use super::engine::{EngineHandle, REPLICA_FILE};
use super::query::QueryBuilder;
use crate::config::{RecoveryMode, ReplicaConfig};
use crate::core::{Result, Signal, SyncError};
use crate::migrations::{AppliedMigration, MigrationManifest, MigrationReport, MigrationRunner};

/// Lifecycle phase of the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaPhase {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    /// Ready, but the server is currently unreachable.
    Offline,
    Destroyed,
}

impl ReplicaPhase {
    /// Whether the replica can serve reads.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Ready | Self::Offline)
    }
}

/// The manager's view of a running sync session: enough to cancel it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub user_id: String,
    pub cancel: CancellationToken,
}

/// Owns the embedded engine and its durable storage namespace.
pub struct ReplicaManager {
    config: ReplicaConfig,
    manifest: Arc<MigrationManifest>,
    phase: Signal<ReplicaPhase>,
    offline: Signal<bool>,
    resets: Signal<u64>,
    engine: Mutex<Option<EngineHandle>>,
    session: Mutex<Option<SessionHandle>>,
    last_report: Mutex<Option<MigrationReport>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ReplicaManager {
    pub fn new(config: ReplicaConfig, manifest: MigrationManifest) -> Self {
        Self {
            config,
            manifest: Arc::new(manifest),
            phase: Signal::new(ReplicaPhase::Uninitialized),
            offline: Signal::new(false),
            resets: Signal::new(0),
            engine: Mutex::new(None),
            session: Mutex::new(None),
            last_report: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn manifest(&self) -> &MigrationManifest {
        &self.manifest
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.config.namespace_dir()
    }

    pub fn replica_path(&self) -> PathBuf {
        self.storage_dir().join(REPLICA_FILE)
    }

    pub fn phase(&self) -> ReplicaPhase {
        self.phase.get()
    }

    pub fn phase_signal(&self) -> Signal<ReplicaPhase> {
        self.phase.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.phase.with(|phase| phase.is_usable())
    }

    pub fn is_offline(&self) -> bool {
        self.offline.get()
    }

    pub fn offline_signal(&self) -> Signal<bool> {
        self.offline.clone()
    }

    /// Bumped after every destructive reset.
    pub fn resets(&self) -> Signal<u64> {
        self.resets.clone()
    }

    pub fn last_report(&self) -> Option<MigrationReport> {
        lock(&self.last_report).clone()
    }

    /// Opens the engine, applies pending migrations and flips to `Ready`.
    ///
    /// Concurrent callers collapse into one initialization. A failure to
    /// restore the image or to migrate it closes the engine and, in
    /// [`RecoveryMode::Reset`], wipes the durable namespace before the error
    /// is returned.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        self.config.validate()?;

        let span = info_span!("replica.initialize", namespace = %self.config.namespace);
        async {
            self.set_phase(ReplicaPhase::Initializing);

            match self.bootstrap().await {
                Ok(report) => {
                    event!(
                        Level::INFO,
                        applied = report.applied.len(),
                        statements = report.statements_executed,
                        "replica ready"
                    );
                    *lock(&self.last_report) = Some(report);
                    self.offline.set(false);
                    self.set_phase(ReplicaPhase::Ready);
                    Ok(())
                }
                Err(err) => {
                    event!(Level::ERROR, error = %err, "replica initialization failed");
                    self.shutdown_engine().await;
                    self.set_phase(ReplicaPhase::Uninitialized);
                    if err.requires_reset() {
                        self.reset_locked(&err.to_string()).await?;
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn bootstrap(&self) -> Result<MigrationReport> {
        fs::create_dir_all(self.storage_dir())?;

        let engine = EngineHandle::open(Some(self.replica_path()))
            .await
            .map_err(untrusted_image)?;
        *lock(&self.engine) = Some(engine.clone());

        engine.ping().await.map_err(untrusted_image)?;
        MigrationRunner::new(&engine)
            .apply(&self.manifest)
            .await
            .map_err(untrusted_image)
    }

    /// Resolves once the replica can serve reads.
    pub async fn wait_until_ready(&self) -> Result<()> {
        self.phase.wait_for(|phase| phase.is_usable()).await?;
        Ok(())
    }

    pub fn engine(&self) -> Result<EngineHandle> {
        if !self.is_ready() {
            return Err(SyncError::NotReady);
        }
        lock(&self.engine).clone().ok_or(SyncError::NotReady)
    }

    pub fn query_builder(&self) -> Result<QueryBuilder> {
        self.engine().map(QueryBuilder::new)
    }

    pub async fn persist(&self) -> Result<()> {
        self.engine()?.persist().await
    }

    pub async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        let engine = self.engine()?;
        MigrationRunner::new(&engine).applied_migrations().await
    }

    /// Lists the migrations recorded in the durable image without
    /// initializing the replica. Nothing is written back to disk.
    pub async fn inspect_applied(&self) -> Result<Vec<AppliedMigration>> {
        let path = self.replica_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let engine = EngineHandle::open(Some(path)).await?;
        let applied = MigrationRunner::new(&engine).applied_migrations().await;
        engine.close().await;
        applied
    }

    /// Toggles the offline flag; a ready replica moves between `Ready` and
    /// `Offline` with it.
    pub fn set_offline(&self, offline: bool) {
        if self.offline.update(|current| std::mem::replace(current, offline) != offline) {
            event!(Level::INFO, offline, "connectivity changed");
        }
        self.phase.update(|phase| match (*phase, offline) {
            (ReplicaPhase::Ready, true) => {
                *phase = ReplicaPhase::Offline;
                true
            }
            (ReplicaPhase::Offline, false) => {
                *phase = ReplicaPhase::Ready;
                true
            }
            _ => false,
        });
    }

    /// Registers the running sync session, cancelling any previous one.
    pub fn attach_session(&self, session: SessionHandle) -> Result<()> {
        if !self.is_ready() {
            session.cancel.cancel();
            return Err(SyncError::NotReady);
        }
        if let Some(previous) = lock(&self.session).replace(session) {
            previous.cancel.cancel();
        }
        Ok(())
    }

    /// Clears the session slot if it still holds session `id`.
    pub fn detach_session(&self, id: u64) -> Option<SessionHandle> {
        let mut slot = lock(&self.session);
        if slot.as_ref().is_some_and(|session| session.id == id) {
            slot.take()
        } else {
            None
        }
    }

    pub fn has_active_session(&self) -> bool {
        lock(&self.session)
            .as_ref()
            .is_some_and(|session| !session.cancel.is_cancelled())
    }

    pub fn active_session(&self) -> Option<SessionHandle> {
        lock(&self.session).clone()
    }

    /// Destructive reset requested after an unrecoverable inconsistency.
    /// Returns whether storage was actually wiped.
    pub async fn request_reset(&self, reason: &str) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        self.reset_locked(reason).await
    }

    async fn reset_locked(&self, reason: &str) -> Result<bool> {
        match self.config.recovery {
            RecoveryMode::Reset => {
                event!(Level::ERROR, reason, namespace = %self.config.namespace, "destructive replica reset");
                self.teardown(true).await?;
                self.set_phase(ReplicaPhase::Uninitialized);
                self.resets.update(|count| {
                    *count += 1;
                    true
                });
                Ok(true)
            }
            RecoveryMode::Preserve => {
                event!(Level::ERROR, reason, "replica reset suppressed, keeping local files");
                Ok(false)
            }
        }
    }

    /// Cancels any sync session, closes the engine and deletes the durable
    /// namespace. Safe to call repeatedly.
    pub async fn destroy(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.teardown(true).await?;
        self.set_phase(ReplicaPhase::Destroyed);
        Ok(())
    }

    /// Persists and closes the engine, keeping durable files.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_ready() {
            if let Err(err) = self.persist().await {
                event!(Level::WARN, error = %err, "persist on close failed");
            }
        }
        self.teardown(false).await?;
        self.set_phase(ReplicaPhase::Uninitialized);
        Ok(())
    }

    async fn teardown(&self, wipe: bool) -> Result<()> {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.cancel.cancel();
        }
        self.shutdown_engine().await;
        self.offline.set(false);

        if wipe {
            match fs::remove_dir_all(self.storage_dir()) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            *lock(&self.last_report) = None;
        }
        Ok(())
    }

    async fn shutdown_engine(&self) {
        let engine = lock(&self.engine).take();
        if let Some(engine) = engine {
            engine.close().await;
        }
    }

    fn set_phase(&self, next: ReplicaPhase) {
        let previous = self.phase.get();
        if previous != next {
            event!(Level::INFO, from = ?previous, to = ?next, "replica phase changed");
            self.phase.set(next);
        }
    }
}

/// Any failure once the durable image is involved leaves a replica that
/// cannot be trusted, so it is reported as reset-worthy.
fn untrusted_image(err: SyncError) -> SyncError {
    if err.requires_reset() {
        return err;
    }
    SyncError::Migration {
        tag: REPLICA_FILE.to_string(),
        message: err.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
