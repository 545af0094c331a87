use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::replica::RowChange;

/// A table replicated from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTable {
    pub name: String,
    pub primary_key: Vec<String>,
    /// Replicated columns; empty means all of them.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Column holding the owning user's id. Falls back to the configured
    /// default owner column when unset.
    #[serde(default)]
    pub owner_column: Option<String>,
}

impl TrackedTable {
    pub fn new(name: &str, primary_key: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            columns: Vec::new(),
            owner_column: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn owner_column(mut self, column: &str) -> Self {
        self.owner_column = Some(column.to_string());
        self
    }
}

/// One subscription request: a table scoped to rows owned by `user_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    pub table: TrackedTable,
    pub owner_column: String,
    pub user_id: String,
}

impl FeedRequest {
    pub fn new(table: TrackedTable, default_owner_column: &str, user_id: &str) -> Self {
        let owner_column = table
            .owner_column
            .clone()
            .unwrap_or_else(|| default_owner_column.to_string());
        Self {
            table,
            owner_column,
            user_id: user_id.to_string(),
        }
    }

    /// SQL predicate restricting the feed to the owner's rows.
    pub fn owner_filter(&self) -> String {
        format!(
            "\"{}\" = '{}'",
            self.owner_column.replace('"', "\"\""),
            self.user_id.replace('\'', "''")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(RowChange),
    /// Everything the server had so far has been delivered.
    UpToDate,
    /// The server discarded its log; truncate the table and start over.
    MustRefetch,
}

pub type FeedStream = BoxStream<'static, Result<FeedEvent>>;

/// Source of per-table change streams.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, request: FeedRequest) -> Result<FeedStream>;

    /// Upstream location recorded in the session descriptor.
    fn endpoint(&self, table: &TrackedTable) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_filter_escapes_quotes() {
        let request = FeedRequest::new(TrackedTable::new("chats", &["id"]), "user_id", "o'brien");
        assert_eq!(request.owner_filter(), "\"user_id\" = 'o''brien'");
    }

    #[test]
    fn test_table_owner_column_overrides_default() {
        let users = TrackedTable::new("users", &["id"]).owner_column("id");
        let request = FeedRequest::new(users, "user_id", "u1");
        assert_eq!(request.owner_filter(), "\"id\" = 'u1'");
    }
}
