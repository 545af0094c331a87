use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use super::feed::{ChangeFeed, FeedEvent, FeedRequest, FeedStream, TrackedTable};
use crate::core::{Result, SyncError, Value};
use crate::replica::RowChange;

type Row = BTreeMap<String, Value>;
type EventSender = mpsc::UnboundedSender<Result<FeedEvent>>;

struct MemorySubscriber {
    owner_column: String,
    user_id: String,
    sender: EventSender,
}

impl MemorySubscriber {
    fn owns(&self, row: &Row) -> bool {
        row.get(&self.owner_column)
            .and_then(Value::as_str)
            .is_some_and(|owner| owner == self.user_id)
    }

    fn send(&self, event: Result<FeedEvent>) -> bool {
        self.sender.send(event).is_ok()
    }
}

#[derive(Default)]
struct MemoryFeedState {
    rows: HashMap<String, Vec<Row>>,
    subscribers: HashMap<String, Vec<MemorySubscriber>>,
    subscribe_failures: HashMap<String, String>,
    stalled: HashSet<String>,
    subscribe_counts: HashMap<String, usize>,
}

/// An in-memory implementation of [`ChangeFeed`] for tests and offline
/// development.
///
/// Holds a server-side snapshot per table and pushes published changes to
/// every open subscription whose owner matches the row.
#[derive(Clone, Default)]
pub struct MemoryChangeFeed {
    state: Arc<Mutex<MemoryFeedState>>,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryFeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a row to the server snapshot and streams it to live subscribers.
    /// Non-object values are ignored.
    pub fn insert_json(&self, table: &str, row: JsonValue) {
        let Some(row) = json_row(&row) else {
            return;
        };
        let mut state = self.lock();
        state.rows.entry(table.to_string()).or_default().push(row.clone());
        broadcast(&mut state, table, &row, RowChange::Upsert(row.clone()));
    }

    /// Removes rows matching `key` and streams the delete.
    pub fn delete_json(&self, table: &str, key: JsonValue) {
        let Some(key) = json_row(&key) else {
            return;
        };
        let mut state = self.lock();
        let mut removed = Vec::new();
        if let Some(rows) = state.rows.get_mut(table) {
            rows.retain(|row| {
                let matches = key.iter().all(|(column, value)| row.get(column) == Some(value));
                if matches {
                    removed.push(row.clone());
                }
                !matches
            });
        }
        for row in removed {
            broadcast(&mut state, table, &row, RowChange::Delete(key.clone()));
        }
    }

    /// Pushes an error into every open subscription of `table`.
    pub fn break_streams(&self, table: &str, message: &str) {
        let mut state = self.lock();
        if let Some(subscribers) = state.subscribers.get_mut(table) {
            for subscriber in subscribers.drain(..) {
                subscriber.send(Err(SyncError::Transport(message.to_string())));
            }
        }
    }

    /// Tells open subscriptions of `table` to drop their state and refetch.
    pub fn must_refetch(&self, table: &str) {
        let mut state = self.lock();
        let rows = state.rows.get(table).cloned().unwrap_or_default();
        if let Some(subscribers) = state.subscribers.get_mut(table) {
            subscribers.retain(|subscriber| {
                if !subscriber.send(Ok(FeedEvent::MustRefetch)) {
                    return false;
                }
                for row in rows.iter().filter(|row| subscriber.owns(row)) {
                    subscriber.send(Ok(FeedEvent::Change(RowChange::Upsert(row.clone()))));
                }
                subscriber.send(Ok(FeedEvent::UpToDate))
            });
        }
    }

    /// Makes future subscriptions to `table` fail immediately.
    pub fn fail_subscriptions(&self, table: &str, message: &str) {
        self.lock()
            .subscribe_failures
            .insert(table.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().subscribe_failures.clear();
    }

    /// Future subscriptions to `table` deliver their snapshot but never
    /// report catching up.
    pub fn stall(&self, table: &str) {
        self.lock().stalled.insert(table.to_string());
    }

    pub fn unstall(&self, table: &str) {
        self.lock().stalled.remove(table);
    }

    /// Total subscribe calls seen for `table`.
    pub fn subscribe_count(&self, table: &str) -> usize {
        self.lock().subscribe_counts.get(table).copied().unwrap_or(0)
    }

    /// Subscriptions of `table` whose consumer is still listening.
    pub fn open_subscriptions(&self, table: &str) -> usize {
        self.lock()
            .subscribers
            .get(table)
            .map(|subscribers| subscribers.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }
}

fn json_row(value: &JsonValue) -> Option<Row> {
    value.as_object().map(|object| {
        object
            .iter()
            .map(|(column, value)| (column.clone(), Value::from_json(value)))
            .collect()
    })
}

fn broadcast(state: &mut MemoryFeedState, table: &str, row: &Row, change: RowChange) {
    if let Some(subscribers) = state.subscribers.get_mut(table) {
        subscribers.retain(|subscriber| {
            if !subscriber.owns(row) {
                return !subscriber.sender.is_closed();
            }
            subscriber.send(Ok(FeedEvent::Change(change.clone())))
                && subscriber.send(Ok(FeedEvent::UpToDate))
        });
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(&self, request: FeedRequest) -> Result<FeedStream> {
        let table = request.table.name.clone();
        let (sender, mut rx) = mpsc::unbounded_channel();

        {
            let mut state = self.lock();
            *state.subscribe_counts.entry(table.clone()).or_default() += 1;

            if let Some(message) = state.subscribe_failures.get(&table) {
                return Err(SyncError::Transport(message.clone()));
            }

            let subscriber = MemorySubscriber {
                owner_column: request.owner_column.clone(),
                user_id: request.user_id.clone(),
                sender,
            };
            for row in state.rows.get(&table).into_iter().flatten() {
                if subscriber.owns(row) {
                    subscriber.send(Ok(FeedEvent::Change(RowChange::Upsert(row.clone()))));
                }
            }
            if !state.stalled.contains(&table) {
                subscriber.send(Ok(FeedEvent::UpToDate));
            }
            state.subscribers.entry(table).or_default().push(subscriber);
        }

        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    fn endpoint(&self, table: &TrackedTable) -> String {
        format!("memory://{}", table.name)
    }
}
