use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

use super::feed::{ChangeFeed, FeedEvent, FeedRequest, TrackedTable};
use crate::core::{Result, SyncError};
use crate::replica::{ChangeBatch, EngineHandle, ReplicaManager, SessionHandle, Statement, quote_ident};

/// Per-table state inside a session.
pub struct TableSubscription {
    pub table: TrackedTable,
    pub endpoint: String,
    caught_up: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TableSubscription {
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }
}

/// One run of the synchronizer. Never mutated after creation apart from the
/// caught-up flags; a restart builds a new session.
pub struct SyncSession {
    pub id: u64,
    pub user_id: String,
    tables: BTreeMap<String, TableSubscription>,
    cancel: CancellationToken,
}

impl SyncSession {
    pub fn all_caught_up(&self) -> bool {
        self.tables.values().all(TableSubscription::is_caught_up)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSubscription> {
        self.tables.values()
    }

    fn cancel(&self) {
        self.cancel.cancel();
        for subscription in self.tables.values() {
            subscription.task.abort();
        }
    }
}

struct SynchronizerInner {
    manager: Arc<ReplicaManager>,
    feed: Arc<dyn ChangeFeed>,
    session: Mutex<Option<Arc<SyncSession>>>,
    start_lock: tokio::sync::Mutex<()>,
    next_session_id: AtomicU64,
    restart: Arc<Notify>,
    last_error: Mutex<Option<SyncError>>,
}

impl SynchronizerInner {
    fn session_slot(&self) -> MutexGuard<'_, Option<Arc<SyncSession>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(&self) {
        let session = self.session_slot().take();
        if let Some(session) = session {
            session.cancel();
            self.manager.detach_session(session.id);
            event!(Level::INFO, session = session.id, "sync session stopped");
        }
    }

    fn on_subscription_error(&self, session_id: u64, table: &str, err: SyncError) {
        let err = match err {
            err @ SyncError::Subscription { .. } => err,
            other => SyncError::Subscription {
                table: table.to_string(),
                message: other.to_string(),
            },
        };
        event!(Level::WARN, session = session_id, table, error = %err, "subscription failed");
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);

        let current = self
            .session_slot()
            .as_ref()
            .is_some_and(|session| session.id == session_id);
        if current {
            self.stop();
            self.restart.notify_one();
        }
    }
}

/// Drives per-table change feeds into the replica.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<SynchronizerInner>,
}

impl Synchronizer {
    pub fn new(manager: Arc<ReplicaManager>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            inner: Arc::new(SynchronizerInner {
                manager,
                feed,
                session: Mutex::new(None),
                start_lock: tokio::sync::Mutex::new(()),
                next_session_id: AtomicU64::new(1),
                restart: Arc::new(Notify::new()),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Notified whenever a subscription error stopped the session.
    pub fn restart_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.restart)
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .session_slot()
            .as_ref()
            .is_some_and(|session| !session.is_cancelled())
    }

    pub fn session(&self) -> Option<Arc<SyncSession>> {
        self.inner.session_slot().clone()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribes to every table for `user_id`, waits until all of them
    /// caught up, persists the replica and verifies it.
    ///
    /// A no-op while a session is already running. Verification failure
    /// stops the session and requests a destructive reset.
    pub async fn start(&self, tables: &[TrackedTable], user_id: &str) -> Result<()> {
        let _guard = self.inner.start_lock.lock().await;
        if self.is_active() {
            return Ok(());
        }

        let engine = self.inner.manager.engine()?;
        let session = self.open_session(&engine, tables, user_id)?;
        let span = info_span!("sync.start", session = session.id, user_id = %user_id);

        async {
            self.wait_caught_up(&session).await?;
            self.inner.manager.persist().await?;

            if let Err(err) = self.verify(&engine, user_id).await {
                self.stop();
                event!(Level::ERROR, error = %err, "replica verification failed");
                if let Err(reset_err) = self.inner.manager.request_reset(&err.to_string()).await {
                    event!(Level::ERROR, error = %reset_err, "replica reset failed");
                }
                return Err(err);
            }

            event!(Level::INFO, tables = session.tables.len(), "replica synced");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Cancels every open subscription. Safe to call at any time.
    pub fn stop(&self) {
        self.inner.stop();
    }

    fn open_session(
        &self,
        engine: &EngineHandle,
        tables: &[TrackedTable],
        user_id: &str,
    ) -> Result<Arc<SyncSession>> {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        *self.inner.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let cancel = CancellationToken::new();
        let owner_column = self.inner.manager.config().owner_column.clone();

        let mut subscriptions = BTreeMap::new();
        for table in tables {
            let caught_up = Arc::new(AtomicBool::new(false));
            let request = FeedRequest::new(table.clone(), &owner_column, user_id);
            let task = tokio::spawn(run_table(
                Arc::downgrade(&self.inner),
                Arc::clone(&self.inner.feed),
                engine.clone(),
                id,
                request,
                Arc::clone(&caught_up),
                cancel.clone(),
            ));
            subscriptions.insert(
                table.name.clone(),
                TableSubscription {
                    table: table.clone(),
                    endpoint: self.inner.feed.endpoint(table),
                    caught_up,
                    task,
                },
            );
        }

        let session = Arc::new(SyncSession {
            id,
            user_id: user_id.to_string(),
            tables: subscriptions,
            cancel: cancel.clone(),
        });

        let previous = self.inner.session_slot().replace(Arc::clone(&session));
        if let Some(previous) = previous {
            previous.cancel();
        }

        if let Err(err) = self.inner.manager.attach_session(SessionHandle {
            id,
            user_id: user_id.to_string(),
            cancel,
        }) {
            self.inner.stop();
            return Err(err);
        }

        event!(Level::INFO, session = id, tables = tables.len(), "sync session started");
        Ok(session)
    }

    async fn wait_caught_up(&self, session: &SyncSession) -> Result<()> {
        let interval = self.inner.manager.config().catch_up_poll_interval;
        loop {
            if session.is_cancelled() {
                return Err(self.last_error().unwrap_or_else(|| SyncError::Subscription {
                    table: "*".to_string(),
                    message: "session stopped before catching up".to_string(),
                }));
            }
            if session.all_caught_up() {
                return Ok(());
            }
            // A task can fail before the session was registered, in which
            // case nobody stopped it yet.
            if session
                .tables
                .values()
                .any(|subscription| subscription.task.is_finished() && !subscription.is_caught_up())
            {
                self.inner.stop();
                self.inner.restart.notify_one();
                continue;
            }
            tokio::select! {
                _ = session.cancel.cancelled() => {}
                _ = sleep(interval) => {}
            }
        }
    }

    async fn verify(&self, engine: &EngineHandle, user_id: &str) -> Result<()> {
        let config = self.inner.manager.config();
        let statement = Statement::raw(
            format!(
                "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
                quote_ident(&config.verification_table)?,
                quote_ident(&config.verification_key)?
            ),
            vec![user_id.into()],
            [config.verification_table.clone()],
        );

        let mut last_failure = String::from("user row not found");
        for attempt in 1..=config.verification_attempts {
            match engine.query(statement.clone()).await {
                Ok(result) if !result.is_empty() => {
                    event!(Level::DEBUG, attempt, "replica verified");
                    return Ok(());
                }
                Ok(_) => last_failure = "user row not found".to_string(),
                Err(err) => last_failure = err.to_string(),
            }
            event!(Level::DEBUG, attempt, reason = %last_failure, "verification attempt failed");
            if attempt < config.verification_attempts {
                sleep(config.verification_delay).await;
            }
        }

        Err(SyncError::Verification(format!(
            "{} after {} attempts",
            last_failure, config.verification_attempts
        )))
    }
}

async fn run_table(
    owner: Weak<SynchronizerInner>,
    feed: Arc<dyn ChangeFeed>,
    engine: EngineHandle,
    session_id: u64,
    request: FeedRequest,
    caught_up: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let table = request.table.name.clone();
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = pump(feed.as_ref(), &engine, request, &caught_up) => result,
    };

    if let Err(err) = result {
        if cancel.is_cancelled() {
            return;
        }
        if let Some(inner) = owner.upgrade() {
            inner.on_subscription_error(session_id, &table, err);
        }
    }
}

/// Applies feed events until the stream fails or ends. Changes between two
/// `UpToDate` markers land in one replica transaction.
async fn pump(
    feed: &dyn ChangeFeed,
    engine: &EngineHandle,
    request: FeedRequest,
    caught_up: &AtomicBool,
) -> Result<()> {
    let table = request.table.name.clone();
    let primary_key = request.table.primary_key.clone();
    let mut stream = feed.subscribe(request).await?;
    let mut batch = ChangeBatch::new(&table, &primary_key);

    while let Some(event) = stream.next().await {
        match event? {
            FeedEvent::Change(change) => batch.changes.push(change),
            FeedEvent::MustRefetch => {
                batch.changes.clear();
                batch.truncate = true;
            }
            FeedEvent::UpToDate => {
                let live = caught_up.load(Ordering::Acquire);
                if !batch.is_empty() {
                    let ready = mem::replace(&mut batch, ChangeBatch::new(&table, &primary_key));
                    let changes = ready.changes.len();
                    engine.apply_changes(ready).await?;
                    event!(Level::DEBUG, table = %table, changes, "feed batch applied");
                    if live {
                        engine.persist().await?;
                    }
                }
                if !live {
                    event!(Level::DEBUG, table = %table, "table caught up");
                }
                caught_up.store(true, Ordering::Release);
            }
        }
    }

    Err(SyncError::Subscription {
        table,
        message: "feed ended".to_string(),
    })
}
