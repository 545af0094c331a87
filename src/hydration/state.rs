use std::fmt;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::core::{Result, Row};
use crate::replica::{QueryBuilder, Statement};

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Provenance {
    /// Waiting for the server-rendered snapshot.
    SsrPending,
    /// Holding (or done waiting for) the server-rendered snapshot.
    SsrSettled,
    /// Delivered by a live replica query. Terminal.
    Live,
}

/// Snapshot of one cache entry as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct HydrationState<T> {
    pub value: Option<T>,
    pub provenance: Provenance,
}

impl<T> HydrationState<T> {
    pub fn pending() -> Self {
        Self {
            value: None,
            provenance: Provenance::SsrPending,
        }
    }

    pub fn loading(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_from_server(&self) -> bool {
        self.provenance != Provenance::Live
    }

    pub fn is_live(&self) -> bool {
        self.provenance == Provenance::Live
    }
}

/// Server-rendered value handed to `get`.
pub enum SsrSnapshot<T> {
    Absent,
    Ready(T),
    /// Resolves later, e.g. a streamed server response.
    Deferred(BoxFuture<'static, Result<T>>),
}

impl<T> SsrSnapshot<T> {
    pub fn deferred<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }
}

impl<T> fmt::Debug for SsrSnapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "Absent"),
            Self::Ready(_) => write!(f, "Ready(..)"),
            Self::Deferred(_) => write!(f, "Deferred(..)"),
        }
    }
}

impl<T> From<Option<T>> for SsrSnapshot<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Ready(value),
            None => Self::Absent,
        }
    }
}

/// A named query whose result can be hydrated from the replica.
///
/// Implementations must be pure: the same `(name, args)` always builds the
/// same statement and `transform` only maps rows to the output type.
pub trait HydratableQuery: Send + Sync + 'static {
    type Args: Serialize + Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    fn name(&self) -> &str;

    fn build(&self, query: &QueryBuilder, args: &Self::Args) -> Result<Statement>;

    fn transform(&self, rows: Vec<Row>) -> Result<Self::Output>;
}

/// Cache identity: query name plus canonical JSON of its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub name: String,
    pub args: String,
}

impl CacheKey {
    pub fn new<A: Serialize>(name: &str, args: &A) -> Result<Self> {
        let args = canonicalize(serde_json::to_value(args)?).to_string();
        Ok(Self {
            name: name.to_string(),
            args,
        })
    }
}

/// Sorts object keys recursively so equal arguments always serialise alike.
fn canonicalize(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(String, JsonValue)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            JsonValue::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args)
    }
}
