use std::any::Any;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{Level, event};

use super::entry::{ErasedEntry, HydrationEntry};
use super::state::{CacheKey, HydratableQuery, HydrationState, Provenance, SsrSnapshot};
use crate::core::{Result, SignalSubscription, SyncError};
use crate::replica::ReplicaManager;

struct Slot {
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn ErasedEntry>,
}

impl Slot {
    fn new<Q: HydratableQuery>(entry: &Arc<HydrationEntry<Q>>) -> Self {
        Self {
            typed: Arc::clone(entry) as Arc<dyn Any + Send + Sync>,
            erased: Arc::clone(entry) as Arc<dyn ErasedEntry>,
        }
    }
}

struct Registry {
    entries: HashMap<CacheKey, Slot>,
    /// Unsubscribed entries, least recently touched first.
    idle: LruCache<CacheKey, Instant>,
}

struct CacheInner {
    manager: Arc<ReplicaManager>,
    idle_ttl: Option<Duration>,
    registry: Mutex<Registry>,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_idle(&self, registry: &mut Registry, key: &CacheKey, now: Instant) {
        if let Some((evicted, _)) = registry.idle.push(key.clone(), now) {
            if evicted != *key {
                Self::remove_if_idle(registry, &evicted);
            }
        }
    }

    fn evict_expired(&self, registry: &mut Registry, now: Instant) -> usize {
        let Some(ttl) = self.idle_ttl else {
            return 0;
        };

        let mut evicted = 0;
        loop {
            let expired = match registry.idle.peek_lru() {
                Some((key, since)) if now.saturating_duration_since(*since) >= ttl => key.clone(),
                _ => break,
            };
            registry.idle.pop(&expired);
            if Self::remove_if_idle(registry, &expired) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Removes `key` unless it is subscribed or someone still holds a
    /// handle to it. A held entry is marked idle again when its last handle
    /// goes away.
    fn remove_if_idle(registry: &mut Registry, key: &CacheKey) -> bool {
        let idle = registry
            .entries
            .get(key)
            .is_some_and(|slot| slot.erased.subscriber_count() == 0 && slot.erased.handle_count() == 0);
        if idle {
            registry.entries.remove(key);
            event!(Level::DEBUG, key = %key, "hydration entry evicted");
        }
        idle
    }
}

/// Process-wide cache of hydrated query results, keyed by query name and
/// arguments.
///
/// Entries start from the server-rendered snapshot and switch to a live
/// replica query once subscribed. Unsubscribed entries are kept for
/// `hydration_idle_ttl` and at most `hydration_idle_capacity` of them.
#[derive(Clone)]
pub struct HydrationCache {
    inner: Arc<CacheInner>,
}

impl HydrationCache {
    pub fn new(manager: Arc<ReplicaManager>) -> Self {
        let config = manager.config();
        let capacity = NonZeroUsize::new(config.hydration_idle_capacity).unwrap_or(NonZeroUsize::MIN);
        let idle_ttl = config.hydration_idle_ttl;

        Self {
            inner: Arc::new(CacheInner {
                manager,
                idle_ttl,
                registry: Mutex::new(Registry {
                    entries: HashMap::new(),
                    idle: LruCache::new(capacity),
                }),
            }),
        }
    }

    /// Returns the entry for `(query, args)`, creating it on first use, and
    /// feeds it the server snapshot. A snapshot arriving after live data is
    /// ignored.
    pub fn get<Q: HydratableQuery>(
        &self,
        query: &Arc<Q>,
        args: Q::Args,
        ssr: SsrSnapshot<Q::Output>,
    ) -> Result<Hydrated<Q>> {
        let key = CacheKey::new(query.name(), &args)?;
        let now = Instant::now();

        let hydrated = {
            let mut registry = self.inner.lock();
            self.inner.evict_expired(&mut registry, now);

            let entry = match registry.entries.get(&key) {
                Some(slot) => Arc::clone(&slot.typed)
                    .downcast::<HydrationEntry<Q>>()
                    .map_err(|_| {
                        SyncError::TypeMismatch(format!("cache key {} is bound to another query type", key))
                    })?,
                None => {
                    let entry = HydrationEntry::new(key.clone(), Arc::clone(query), args);
                    registry.entries.insert(key.clone(), Slot::new(&entry));
                    event!(Level::DEBUG, key = %key, "hydration entry created");
                    entry
                }
            };

            if entry.subscriber_count() == 0 {
                self.inner.mark_idle(&mut registry, &key, now);
            }
            Hydrated::new(entry, Arc::clone(&self.inner))
        };

        hydrated.entry.feed_ssr(ssr);
        Ok(hydrated)
    }

    /// Restarts every subscribed live query against the current engine.
    /// Called after a replica reset.
    pub fn refresh(&self) -> usize {
        let entries: Vec<Arc<dyn ErasedEntry>> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|slot| Arc::clone(&slot.erased))
            .collect();

        let restarted = entries
            .into_iter()
            .filter(|entry| Arc::clone(entry).restart_live(&self.inner.manager))
            .count();
        event!(Level::INFO, restarted, "hydration cache refreshed");
        restarted
    }

    /// Drops idle entries whose TTL has elapsed.
    pub fn evict_idle(&self) -> usize {
        let mut registry = self.inner.lock();
        self.inner.evict_expired(&mut registry, Instant::now())
    }

    /// Tears down every live query without forgetting subscribers; a later
    /// `refresh` brings them back.
    pub fn suspend(&self) {
        let entries: Vec<Arc<dyn ErasedEntry>> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|slot| Arc::clone(&slot.erased))
            .collect();
        for entry in entries {
            entry.stop_live_task();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_len(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|slot| slot.erased.has_live_task())
            .count()
    }
}

/// Handle to one cache entry.
pub struct Hydrated<Q: HydratableQuery> {
    entry: Arc<HydrationEntry<Q>>,
    cache: Arc<CacheInner>,
}

impl<Q: HydratableQuery> Clone for Hydrated<Q> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.entry), Arc::clone(&self.cache))
    }
}

impl<Q: HydratableQuery> Drop for Hydrated<Q> {
    fn drop(&mut self) {
        let mut registry = self.cache.lock();
        if self.entry.release_handle() == 0 && self.entry.subscriber_count() == 0 {
            self.cache
                .mark_idle(&mut registry, self.entry.key(), Instant::now());
        }
    }
}

impl<Q: HydratableQuery> Hydrated<Q> {
    fn new(entry: Arc<HydrationEntry<Q>>, cache: Arc<CacheInner>) -> Self {
        entry.retain_handle();
        Self { entry, cache }
    }

    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    pub fn state(&self) -> HydrationState<Q::Output> {
        self.entry.state()
    }

    pub fn value(&self) -> Option<Q::Output> {
        self.entry.state().value
    }

    pub fn loading(&self) -> bool {
        self.entry.signal().with(|state| state.loading())
    }

    pub fn is_from_server(&self) -> bool {
        self.entry.signal().with(|state| state.is_from_server())
    }

    pub fn provenance(&self) -> Provenance {
        self.entry.signal().with(|state| state.provenance)
    }

    pub fn subscriber_count(&self) -> usize {
        self.entry.subscriber_count()
    }

    /// Resolves with the first state satisfying `predicate`.
    pub async fn wait_for<P>(&self, predicate: P) -> Result<HydrationState<Q::Output>>
    where
        P: Fn(&HydrationState<Q::Output>) -> bool + Send + Sync + 'static,
    {
        self.entry.signal().wait_for(predicate).await
    }

    /// Registers `callback` for every state change and invokes it once with
    /// the current state. The first subscriber starts the live query.
    pub fn subscribe<F>(&self, callback: F) -> HydrationSubscription
    where
        F: Fn(&HydrationState<Q::Output>) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let listener = Arc::clone(&callback);
        let signal = self.entry.signal().subscribe(move |state| listener(state));

        {
            let mut registry = self.cache.lock();
            registry.idle.pop(self.entry.key());
            self.entry.acquire(&self.cache.manager);
        }

        callback(&self.entry.state());
        HydrationSubscription {
            entry: Arc::clone(&self.entry) as Arc<dyn ErasedEntry>,
            cache: Arc::clone(&self.cache),
            signal: Some(signal),
        }
    }
}

/// Returned by [`Hydrated::subscribe`]. Dropping it unsubscribes; the last
/// subscriber tears down the live query and leaves the entry idle.
pub struct HydrationSubscription {
    entry: Arc<dyn ErasedEntry>,
    cache: Arc<CacheInner>,
    signal: Option<SignalSubscription>,
}

impl HydrationSubscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(signal) = self.signal.take() else {
            return;
        };
        drop(signal);

        let mut registry = self.cache.lock();
        if self.entry.release() == 0 {
            self.cache
                .mark_idle(&mut registry, self.entry.key(), Instant::now());
        }
    }
}

impl Drop for HydrationSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
