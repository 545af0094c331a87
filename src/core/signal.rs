use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::oneshot;

use super::Result;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalState<T> {
    value: T,
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

struct SignalInner<T> {
    state: Mutex<SignalState<T>>,
}

impl<T> SignalInner<T> {
    fn lock(&self) -> MutexGuard<'_, SignalState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Observable state cell.
///
/// Listeners run on the thread that performed the write, after the internal
/// lock is released, so a listener may read or write the same signal.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Signal")
            .field("value", &state.value)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl<T: Default + Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState {
                    value,
                    next_id: 0,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Reads the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock().value)
    }

    pub fn set(&self, value: T) {
        self.update(move |current| {
            *current = value;
            true
        });
    }

    /// Mutates the value in place. Listeners are notified only when `f`
    /// reports a change.
    pub fn update(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        let (snapshot, listeners) = {
            let mut state = self.inner.lock();
            if !f(&mut state.value) {
                return false;
            }
            let listeners: Vec<Listener<T>> = state
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            (state.value.clone(), listeners)
        };

        for listener in listeners {
            listener(&snapshot);
        }
        true
    }

    pub fn subscribe<F>(&self, callback: F) -> SignalSubscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut state = self.inner.lock();
        self.register(&mut state, Arc::new(callback))
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Resolves with the first value satisfying `predicate`, including the
    /// current one. The internal listener removes itself once it fires.
    pub async fn wait_for<P>(&self, predicate: P) -> Result<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let _subscription = {
            let mut state = self.inner.lock();
            if predicate(&state.value) {
                return Ok(state.value.clone());
            }

            let tx = Mutex::new(Some(tx));
            let listener: Listener<T> = Arc::new(move |value: &T| {
                if predicate(value) {
                    let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                    if let Some(sender) = sender {
                        let _ = sender.send(value.clone());
                    }
                }
            });
            self.register(&mut state, listener)
        };

        Ok(rx.await?)
    }

    fn register(&self, state: &mut SignalState<T>, listener: Listener<T>) -> SignalSubscription {
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, listener));

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        SignalSubscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().listeners.retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }
}

/// Handle returned by [`Signal::subscribe`]. Dropping it unsubscribes.
pub struct SignalSubscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SignalSubscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for SignalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSubscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let signal = Signal::new(0u32);
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        let subscription = signal.subscribe(move |value| {
            seen_clone.store(*value as usize, Ordering::SeqCst);
        });

        signal.set(3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        subscription.unsubscribe();
        signal.set(9);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn test_update_without_change_is_silent() {
        let signal = Signal::new(String::from("a"));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _sub = signal.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!signal.update(|_| false));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(signal.update(|value| {
            value.push('b');
            true
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(signal.get(), "ab");
    }

    #[tokio::test]
    async fn test_wait_for_resolves_immediately_when_satisfied() {
        let signal = Signal::new(5u32);
        let value = signal.wait_for(|v| *v > 1).await.unwrap();
        assert_eq!(value, 5);
        assert_eq!(signal.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_unsubscribes_after_firing() {
        let signal = Signal::new(false);
        let writer = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set(true);
        });

        assert!(signal.wait_for(|ready| *ready).await.unwrap());
        assert_eq!(signal.listener_count(), 0);
    }
}
