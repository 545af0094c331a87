mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use replisync::replica::RowChange;
use replisync::{
    ChangeFeed, EligibilityProbe, FeedEvent, HttpChangeFeed, HttpEligibilityProbe, Statement, SyncError,
    SyncRuntime, TrackedTable, Value,
};
use replisync::sync::FeedRequest;
use serde_json::json;

#[derive(Clone, Default)]
struct FakeServer {
    requests: Arc<Mutex<Vec<(HashMap<String, String>, HeaderMap)>>>,
    conflict_pending: Arc<AtomicBool>,
}

impl FakeServer {
    fn requests(&self) -> Vec<(HashMap<String, String>, HeaderMap)> {
        self.requests.lock().unwrap().clone()
    }
}

fn snapshot(table: &str) -> serde_json::Value {
    match table {
        "users" => json!([
            {"key": "users/u1", "value": {"id": "u1", "name": "Alice", "user_id": "u1"}, "headers": {"operation": "insert"}},
            {"headers": {"control": "up-to-date"}}
        ]),
        _ => json!([
            {"key": "chats/c1", "value": {"id": "c1", "user_id": "u1", "title": "Hello"}, "headers": {"operation": "insert"}},
            {"headers": {"control": "up-to-date"}}
        ]),
    }
}

fn live_update(table: &str) -> serde_json::Value {
    match table {
        "users" => json!([{"headers": {"control": "up-to-date"}}]),
        _ => json!([
            {"key": "chats/c2", "value": {"id": "c2", "user_id": "u1", "title": "Later"}, "headers": {"operation": "update"}},
            {"headers": {"control": "up-to-date"}}
        ]),
    }
}

async fn shape(
    State(server): State<FakeServer>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    server.requests.lock().unwrap().push((params.clone(), headers));

    if server.conflict_pending.swap(false, Ordering::SeqCst) {
        return StatusCode::CONFLICT.into_response();
    }

    let table = params.get("table").cloned().unwrap_or_default();
    match params.get("offset").map(String::as_str) {
        Some("-1") => (
            [("x-shape-handle", "h1"), ("x-shape-offset", "0_1")],
            Json(snapshot(&table)),
        )
            .into_response(),
        Some("0_1") => ([("x-shape-offset", "0_2")], Json(live_update(&table))).into_response(),
        _ => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

async fn status(headers: HeaderMap) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == "Bearer secret");
    Json(json!({"canSync": authorized, "userId": "u1", "plan": "free"})).into_response()
}

async fn broken() -> Response {
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

async fn serve(server: FakeServer) -> SocketAddr {
    let app = Router::new()
        .route("/api/sync/v1/shape", get(shape))
        .route("/api/sync/status", get(status))
        .route("/broken", get(broken))
        .with_state(server);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn chats_request() -> FeedRequest {
    let table = TrackedTable::new("chats", &["id"]).columns(&["id", "user_id", "title"]);
    FeedRequest::new(table, "user_id", "u1")
}

fn upsert_id(event: &FeedEvent) -> Option<String> {
    match event {
        FeedEvent::Change(RowChange::Upsert(row)) => row.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

#[tokio::test]
async fn test_shape_stream_snapshot_then_live() {
    let server = FakeServer::default();
    let addr = serve(server.clone()).await;
    let feed = HttpChangeFeed::new(
        &format!("http://{}/api/sync/v1/shape", addr),
        Some("secret".to_string()),
        reqwest::Client::new(),
    );

    let mut stream = feed.subscribe(chats_request()).await.unwrap();
    let events: Vec<FeedEvent> = (&mut stream)
        .take(4)
        .map(|event| event.unwrap())
        .collect()
        .await;

    assert_eq!(upsert_id(&events[0]).as_deref(), Some("c1"));
    assert_eq!(events[1], FeedEvent::UpToDate);
    assert_eq!(upsert_id(&events[2]).as_deref(), Some("c2"));
    assert_eq!(events[3], FeedEvent::UpToDate);
    drop(stream);

    let requests = server.requests();
    let (first, headers) = &requests[0];
    assert_eq!(first.get("table").map(String::as_str), Some("chats"));
    assert_eq!(first.get("offset").map(String::as_str), Some("-1"));
    assert_eq!(first.get("where").map(String::as_str), Some("\"user_id\" = 'u1'"));
    assert_eq!(first.get("columns").map(String::as_str), Some("id,user_id,title"));
    assert!(!first.contains_key("live"));
    assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
    assert_eq!(headers.get("authorization").unwrap(), "Bearer secret");

    let (second, _) = &requests[1];
    assert_eq!(second.get("handle").map(String::as_str), Some("h1"));
    assert_eq!(second.get("offset").map(String::as_str), Some("0_1"));
    assert_eq!(second.get("live").map(String::as_str), Some("true"));
}

#[tokio::test]
async fn test_conflict_becomes_must_refetch() {
    let server = FakeServer::default();
    server.conflict_pending.store(true, Ordering::SeqCst);
    let addr = serve(server.clone()).await;
    let feed = HttpChangeFeed::new(&format!("http://{}/api/sync/v1/shape", addr), None, reqwest::Client::new());

    let mut stream = feed.subscribe(chats_request()).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), FeedEvent::MustRefetch);
    assert_eq!(upsert_id(&stream.next().await.unwrap().unwrap()).as_deref(), Some("c1"));

    let requests = server.requests();
    assert_eq!(requests[1].0.get("offset").map(String::as_str), Some("-1"));
    assert!(requests[0].1.get("authorization").is_none());
}

#[tokio::test]
async fn test_server_error_ends_stream_with_transport_error() {
    let server = FakeServer::default();
    let addr = serve(server).await;
    let feed = HttpChangeFeed::new(&format!("http://{}/broken", addr), None, reqwest::Client::new());

    let mut stream = feed.subscribe(chats_request()).await.unwrap();
    assert!(matches!(stream.next().await, Some(Err(SyncError::Transport(_)))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_status_probe() {
    let addr = serve(FakeServer::default()).await;
    let url = format!("http://{}/api/sync/status", addr);

    let probe = HttpEligibilityProbe::new(&url, Some("secret".to_string()), reqwest::Client::new());
    let eligibility = probe.check().await.unwrap();
    assert!(eligibility.can_sync);
    assert_eq!(eligibility.user_id.as_deref(), Some("u1"));

    let anonymous = HttpEligibilityProbe::new(&url, None, reqwest::Client::new());
    assert!(!anonymous.check().await.unwrap().can_sync);

    let broken = HttpEligibilityProbe::new(&format!("http://{}/broken", addr), None, reqwest::Client::new());
    assert!(matches!(broken.check().await, Err(SyncError::Transport(_))));
}

#[tokio::test]
async fn test_unreachable_server_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let probe = HttpEligibilityProbe::new(&format!("http://{}/api/sync/status", addr), None, reqwest::Client::new());
    let err = probe.check().await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_runtime_syncs_over_http() {
    let addr = serve(FakeServer::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path())
        .server_url(&format!("http://{}", addr))
        .auth_token("secret");

    let runtime = SyncRuntime::http(config, common::manifest(), common::tables()).unwrap();
    runtime.start().await.unwrap();
    assert!(common::eventually(|| runtime.synchronizer().is_active()).await);

    let engine = runtime.manager().engine().unwrap();
    let mut titles = Vec::new();
    for _ in 0..200 {
        titles = engine
            .query(Statement::new("SELECT title FROM chats ORDER BY id"))
            .await
            .unwrap()
            .into_rows()
            .iter()
            .filter_map(|row| row.get_str("title").map(str::to_string))
            .collect();
        if titles.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(titles, vec!["Hello".to_string(), "Later".to_string()]);

    runtime.shutdown().await.unwrap();
    assert!(runtime.manager().replica_path().exists());
}
