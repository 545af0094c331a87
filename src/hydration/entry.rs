use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{Level, event};

use super::state::{CacheKey, HydratableQuery, HydrationState, Provenance, SsrSnapshot};
use crate::core::{Result, Signal};
use crate::replica::{LiveQuery, ReplicaManager};

struct EntryControl {
    subscribers: usize,
    live: Option<JoinHandle<()>>,
}

/// One cached query result.
///
/// Writes to `state` go through the signal's lock, and the live epoch is
/// bumped under that same lock, so a torn-down live task can never land a
/// late delivery.
pub(crate) struct HydrationEntry<Q: HydratableQuery> {
    key: CacheKey,
    query: Arc<Q>,
    args: Q::Args,
    state: Signal<HydrationState<Q::Output>>,
    epoch: AtomicU64,
    /// Outstanding `Hydrated` handles; an entry with handles is never evicted.
    handles: AtomicUsize,
    control: Mutex<EntryControl>,
}

impl<Q: HydratableQuery> HydrationEntry<Q> {
    pub(crate) fn new(key: CacheKey, query: Arc<Q>, args: Q::Args) -> Arc<Self> {
        Arc::new(Self {
            key,
            query,
            args,
            state: Signal::new(HydrationState::pending()),
            epoch: AtomicU64::new(0),
            handles: AtomicUsize::new(0),
            control: Mutex::new(EntryControl {
                subscribers: 0,
                live: None,
            }),
        })
    }

    pub(crate) fn state(&self) -> HydrationState<Q::Output> {
        self.state.get()
    }

    pub(crate) fn signal(&self) -> &Signal<HydrationState<Q::Output>> {
        &self.state
    }

    pub(crate) fn retain_handle(&self) {
        self.handles.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of handles left.
    pub(crate) fn release_handle(&self) -> usize {
        self.handles.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    fn control(&self) -> MutexGuard<'_, EntryControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds a server-rendered snapshot. Ignored once the entry went live.
    pub(crate) fn feed_ssr(self: &Arc<Self>, snapshot: SsrSnapshot<Q::Output>) {
        match snapshot {
            SsrSnapshot::Absent => {}
            SsrSnapshot::Ready(value) => {
                self.settle_ssr(Some(value));
            }
            SsrSnapshot::Deferred(future) => {
                let Ok(runtime) = Handle::try_current() else {
                    event!(Level::WARN, key = %self.key, "no runtime to resolve deferred snapshot");
                    return;
                };
                let entry = Arc::clone(self);
                runtime.spawn(async move {
                    match future.await {
                        Ok(value) => entry.settle_ssr(Some(value)),
                        Err(err) => {
                            event!(Level::WARN, key = %entry.key, error = %err, "deferred snapshot failed");
                            entry.settle_ssr(None)
                        }
                    };
                });
            }
        }
    }

    fn settle_ssr(&self, value: Option<Q::Output>) -> bool {
        self.state.update(|state| {
            if state.provenance == Provenance::Live {
                return false;
            }
            match value {
                Some(value) => state.value = Some(value),
                None if state.provenance == Provenance::SsrSettled => return false,
                None => {}
            }
            state.provenance = Provenance::SsrSettled;
            true
        })
    }

    fn deliver_live(&self, epoch: u64, value: Q::Output) -> bool {
        let mut current = true;
        self.state.update(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                current = false;
                return false;
            }
            state.value = Some(value);
            state.provenance = Provenance::Live;
            true
        });
        current
    }

    /// Adds a subscriber; the first one starts the live query.
    pub(crate) fn acquire(self: &Arc<Self>, manager: &Arc<ReplicaManager>) -> usize {
        let mut control = self.control();
        control.subscribers += 1;
        let running = control
            .live
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if !running {
            self.start_live(&mut control, manager);
        }
        control.subscribers
    }

    fn start_live(self: &Arc<Self>, control: &mut EntryControl, manager: &Arc<ReplicaManager>) {
        let Ok(runtime) = Handle::try_current() else {
            event!(Level::WARN, key = %self.key, "no runtime, live query not started");
            return;
        };
        let epoch = self.epoch.load(Ordering::SeqCst);
        let entry = Arc::clone(self);
        let manager = Arc::clone(manager);
        control.live = Some(runtime.spawn(entry.run_live(manager, epoch)));
    }

    fn stop_live(&self, control: &mut EntryControl) {
        self.state.update(|_| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            false
        });
        if let Some(task) = control.live.take() {
            task.abort();
        }
    }

    async fn run_live(self: Arc<Self>, manager: Arc<ReplicaManager>, epoch: u64) {
        if manager.wait_until_ready().await.is_err() {
            return;
        }

        let mut live = match self.open_live(&manager).await {
            Ok(live) => live,
            Err(err) => {
                event!(Level::WARN, key = %self.key, error = %err, "live query failed to start");
                return;
            }
        };
        event!(Level::DEBUG, key = %self.key, live_id = live.id(), "live query attached");

        while let Some(delivery) = live.next().await {
            match delivery.and_then(|rows| self.query.transform(rows)) {
                Ok(value) => {
                    if !self.deliver_live(epoch, value) {
                        break;
                    }
                }
                Err(err) => {
                    event!(Level::WARN, key = %self.key, error = %err, "live delivery failed");
                }
            }
        }
    }

    async fn open_live(&self, manager: &ReplicaManager) -> Result<LiveQuery> {
        let builder = manager.query_builder()?;
        let statement = self.query.build(&builder, &self.args)?;
        builder.engine().live_query(statement).await
    }
}

/// Type-erased view the registry keeps of every entry.
pub(crate) trait ErasedEntry: Send + Sync {
    fn key(&self) -> &CacheKey;

    fn subscriber_count(&self) -> usize;

    fn handle_count(&self) -> usize;

    fn has_live_task(&self) -> bool;

    /// Drops a subscriber; the last one tears down the live query.
    fn release(&self) -> usize;

    /// Recreates the live query if anyone is subscribed.
    fn restart_live(self: Arc<Self>, manager: &Arc<ReplicaManager>) -> bool;

    fn stop_live_task(&self);
}

impl<Q: HydratableQuery> ErasedEntry for HydrationEntry<Q> {
    fn key(&self) -> &CacheKey {
        &self.key
    }

    fn subscriber_count(&self) -> usize {
        self.control().subscribers
    }

    fn handle_count(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    fn has_live_task(&self) -> bool {
        self.control()
            .live
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn release(&self) -> usize {
        let mut control = self.control();
        control.subscribers = control.subscribers.saturating_sub(1);
        if control.subscribers == 0 {
            self.stop_live(&mut control);
        }
        control.subscribers
    }

    fn restart_live(self: Arc<Self>, manager: &Arc<ReplicaManager>) -> bool {
        let mut control = self.control();
        if control.subscribers == 0 {
            return false;
        }
        self.stop_live(&mut control);
        self.start_live(&mut control, manager);
        true
    }

    fn stop_live_task(&self) {
        let mut control = self.control();
        self.stop_live(&mut control);
    }
}
