mod common;

use std::sync::Arc;
use std::time::Duration;

use common::ScriptedProbe;
use replisync::{
    Eligibility, HydratableQuery, MemoryChangeFeed, QueryBuilder, ReplicaPhase, Result, Row, SsrSnapshot,
    Statement, SyncRuntime,
};
use serde_json::json;

struct AllChats;

impl HydratableQuery for AllChats {
    type Args = ();
    type Output = usize;

    fn name(&self) -> &str {
        "all_chats"
    }

    fn build(&self, query: &QueryBuilder, _args: &()) -> Result<Statement> {
        query.select("chats").build()
    }

    fn transform(&self, rows: Vec<Row>) -> Result<usize> {
        Ok(rows.len())
    }
}

fn runtime(dir: &std::path::Path, feed: &MemoryChangeFeed, probe: ScriptedProbe) -> SyncRuntime {
    SyncRuntime::new(
        common::config(dir),
        common::manifest(),
        common::tables(),
        Arc::new(feed.clone()),
        Arc::new(probe),
    )
}

#[tokio::test]
async fn test_start_syncs_and_hydrates() {
    let dir = tempfile::tempdir().unwrap();
    let feed = MemoryChangeFeed::new();
    feed.insert_json("users", json!({"id": "u1", "name": "Alice", "user_id": "u1"}));
    feed.insert_json("chats", json!({"id": "c1", "user_id": "u1", "title": "Hello"}));
    let runtime = runtime(dir.path(), &feed, ScriptedProbe::always(Ok(Eligibility::eligible("u1"))));

    runtime.start().await.unwrap();
    let chats = runtime.cache().get(&Arc::new(AllChats), (), SsrSnapshot::Ready(0)).unwrap();
    let _subscription = chats.subscribe(|_| {});

    let state = tokio::time::timeout(
        Duration::from_secs(2),
        chats.wait_for(|state| state.is_live() && state.value == Some(1)),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!state.is_from_server());

    feed.insert_json("chats", json!({"id": "c2", "user_id": "u1", "title": "More"}));
    tokio::time::timeout(Duration::from_secs(2), chats.wait_for(|state| state.value == Some(2)))
        .await
        .unwrap()
        .unwrap();

    runtime.shutdown().await.unwrap();
    assert_eq!(runtime.manager().phase(), ReplicaPhase::Uninitialized);
    assert!(!runtime.synchronizer().is_active());
    assert_eq!(runtime.cache().live_count(), 0);
}

#[tokio::test]
async fn test_verification_failure_rebuilds_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let feed = MemoryChangeFeed::new();
    feed.insert_json("chats", json!({"id": "c1", "user_id": "u1", "title": "Hello"}));
    let runtime = runtime(dir.path(), &feed, ScriptedProbe::always(Ok(Eligibility::eligible("u1"))));
    runtime.start().await.unwrap();

    // Without the user's own row the replica never verifies.
    let resets = runtime.manager().resets();
    assert!(common::eventually(|| resets.get() >= 1).await);

    feed.insert_json("users", json!({"id": "u1", "name": "Alice", "user_id": "u1"}));
    assert!(
        common::eventually(|| runtime.manager().is_ready() && runtime.synchronizer().is_active()).await
    );

    runtime.destroy().await.unwrap();
    assert_eq!(runtime.manager().phase(), ReplicaPhase::Destroyed);
    assert!(!runtime.manager().storage_dir().exists());
}

#[tokio::test]
async fn test_recover_requeries_subscribed_entries() {
    let dir = tempfile::tempdir().unwrap();
    let feed = MemoryChangeFeed::new();
    let runtime = runtime(dir.path(), &feed, ScriptedProbe::always(Ok(Eligibility::ineligible())));
    runtime.start().await.unwrap();

    runtime
        .manager()
        .engine()
        .unwrap()
        .execute(Statement::new("INSERT INTO chats (id, user_id, title) VALUES ('c1', 'u1', 'local')").touching("chats"))
        .await
        .unwrap();

    let chats = runtime.cache().get(&Arc::new(AllChats), (), SsrSnapshot::Absent).unwrap();
    let _subscription = chats.subscribe(|_| {});
    tokio::time::timeout(Duration::from_secs(2), chats.wait_for(|state| state.value == Some(1)))
        .await
        .unwrap()
        .unwrap();

    runtime.recover().await.unwrap();
    assert!(runtime.manager().is_ready());
    tokio::time::timeout(Duration::from_secs(2), chats.wait_for(|state| state.value == Some(0)))
        .await
        .unwrap()
        .unwrap();

    runtime.shutdown().await.unwrap();
}
