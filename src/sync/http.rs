use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CACHE_CONTROL};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{Level, event};

use super::feed::{ChangeFeed, FeedEvent, FeedRequest, FeedStream, TrackedTable};
use crate::config::ReplicaConfig;
use crate::core::{Result, SyncError, Value};
use crate::replica::RowChange;

pub const SHAPE_HANDLE_HEADER: &str = "x-shape-handle";
pub const SHAPE_OFFSET_HEADER: &str = "x-shape-offset";
const INITIAL_OFFSET: &str = "-1";

/// Change feed speaking the HTTP shape-stream protocol.
#[derive(Debug, Clone)]
pub struct HttpChangeFeed {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpChangeFeed {
    pub fn new(url: &str, auth_token: Option<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            url: url.to_string(),
            auth_token,
        }
    }

    pub fn from_config(config: &ReplicaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::new(&config.feed_url(), config.auth_token.clone(), client))
    }
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn subscribe(&self, request: FeedRequest) -> Result<FeedStream> {
        let cursor = ShapeCursor {
            client: self.client.clone(),
            url: self.url.clone(),
            auth_token: self.auth_token.clone(),
            where_clause: request.owner_filter(),
            request,
            offset: INITIAL_OFFSET.to_string(),
            handle: None,
            live: false,
            pending: VecDeque::new(),
            failed: false,
        };

        let stream = stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(event) = cursor.pending.pop_front() {
                    return Some((Ok(event), cursor));
                }
                if cursor.failed {
                    return None;
                }
                match cursor.fetch().await {
                    Ok(events) => cursor.pending.extend(events),
                    Err(err) => {
                        cursor.failed = true;
                        return Some((Err(err), cursor));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    fn endpoint(&self, table: &TrackedTable) -> String {
        format!("{}?table={}", self.url, table.name)
    }
}

struct ShapeCursor {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    request: FeedRequest,
    where_clause: String,
    offset: String,
    handle: Option<String>,
    live: bool,
    pending: VecDeque<FeedEvent>,
    failed: bool,
}

impl ShapeCursor {
    fn reset(&mut self) {
        self.offset = INITIAL_OFFSET.to_string();
        self.handle = None;
        self.live = false;
    }

    async fn fetch(&mut self) -> Result<Vec<FeedEvent>> {
        let mut query: Vec<(&str, String)> = vec![
            ("table", self.request.table.name.clone()),
            ("where", self.where_clause.clone()),
            ("offset", self.offset.clone()),
        ];
        if !self.request.table.columns.is_empty() {
            query.push(("columns", self.request.table.columns.join(",")));
        }
        if let Some(handle) = &self.handle {
            query.push(("handle", handle.clone()));
        }
        if self.live {
            query.push(("live", "true".to_string()));
        }

        let mut builder = self
            .client
            .get(&self.url)
            .query(&query)
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            event!(Level::WARN, table = %self.request.table.name, "shape handle expired, refetching");
            self.reset();
            return Ok(vec![FeedEvent::MustRefetch]);
        }
        if !status.is_success() {
            return Err(SyncError::Transport(format!(
                "feed for '{}' returned {}",
                self.request.table.name, status
            )));
        }

        if let Some(handle) = header(&response, SHAPE_HANDLE_HEADER) {
            self.handle = Some(handle);
        }
        if let Some(offset) = header(&response, SHAPE_OFFSET_HEADER) {
            self.offset = offset;
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let body = response.text().await?;
        let events = parse_messages(&body)?;
        for event in &events {
            match event {
                FeedEvent::UpToDate => self.live = true,
                FeedEvent::MustRefetch => self.reset(),
                FeedEvent::Change(_) => {}
            }
        }
        Ok(events)
    }
}

fn header(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct ShapeMessage {
    #[serde(default)]
    value: Option<JsonMap<String, JsonValue>>,
    #[serde(default)]
    headers: ShapeHeaders,
}

#[derive(Debug, Default, Deserialize)]
struct ShapeHeaders {
    operation: Option<String>,
    control: Option<String>,
}

/// Decodes one response body. Messages after a `must-refetch` control are
/// dropped since they belong to the discarded log.
pub fn parse_messages(body: &str) -> Result<Vec<FeedEvent>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let messages: Vec<ShapeMessage> = serde_json::from_str(body)
        .map_err(|err| SyncError::Protocol(format!("malformed feed body: {}", err)))?;

    let mut events = Vec::with_capacity(messages.len());
    for message in messages {
        if let Some(control) = message.headers.control.as_deref() {
            match control {
                "up-to-date" => events.push(FeedEvent::UpToDate),
                "must-refetch" => {
                    events.push(FeedEvent::MustRefetch);
                    break;
                }
                other => {
                    event!(Level::DEBUG, control = other, "ignoring feed control message");
                }
            }
            continue;
        }

        let operation = message
            .headers
            .operation
            .as_deref()
            .ok_or_else(|| SyncError::Protocol("change message without operation".into()))?;
        let row: BTreeMap<String, Value> = message
            .value
            .unwrap_or_default()
            .iter()
            .map(|(column, value)| (column.clone(), Value::from_json(value)))
            .collect();

        let change = match operation {
            "insert" | "update" => RowChange::Upsert(row),
            "delete" => RowChange::Delete(row),
            other => {
                return Err(SyncError::Protocol(format!("unknown operation '{}'", other)));
            }
        };
        events.push(FeedEvent::Change(change));
    }
    Ok(events)
}
