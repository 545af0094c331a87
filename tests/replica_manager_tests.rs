mod common;

use std::sync::Arc;
use std::time::Duration;

use replisync::{
    MigrationManifest, MigrationRecord, RecoveryMode, ReplicaManager, ReplicaPhase, Statement, SyncError,
};

async fn count_users(manager: &ReplicaManager) -> i64 {
    manager
        .engine()
        .unwrap()
        .query(Statement::new("SELECT COUNT(*) AS n FROM users"))
        .await
        .unwrap()
        .first()
        .and_then(|row| row.get_i64("n"))
        .unwrap()
}

async fn insert_user(manager: &ReplicaManager, id: &str) {
    manager
        .engine()
        .unwrap()
        .execute(
            Statement::new("INSERT INTO users (id, name, user_id) VALUES (?1, ?2, ?1)")
                .bind(id)
                .bind("Alice"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_initialize_collapses() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ReplicaManager::new(common::config(dir.path()), common::manifest()));

    let (a, b, c) = tokio::join!(manager.initialize(), manager.initialize(), manager.initialize());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(manager.phase(), ReplicaPhase::Ready);

    let applied = manager.applied_migrations().await.unwrap();
    assert_eq!(applied.len(), 2);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_wait_until_ready_follows_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ReplicaManager::new(common::config(dir.path()), common::manifest()));

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.wait_until_ready().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    manager.initialize().await.unwrap();
    waiter.await.unwrap().unwrap();
    assert!(manager.query_builder().is_ok());
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ReplicaManager::new(common::config(dir.path()), common::manifest());
    manager.initialize().await.unwrap();
    assert!(manager.replica_path().exists());

    manager.destroy().await.unwrap();
    manager.destroy().await.unwrap();

    assert_eq!(manager.phase(), ReplicaPhase::Destroyed);
    assert!(!manager.storage_dir().exists());
    assert!(matches!(manager.engine(), Err(SyncError::NotReady)));
}

#[tokio::test]
async fn test_close_keeps_data_for_next_session() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = ReplicaManager::new(common::config(dir.path()), common::manifest());
        manager.initialize().await.unwrap();
        insert_user(&manager, "u1").await;
        manager.close().await.unwrap();
        assert_eq!(manager.phase(), ReplicaPhase::Uninitialized);
    }

    let manager = ReplicaManager::new(common::config(dir.path()), common::manifest());
    manager.initialize().await.unwrap();
    assert_eq!(count_users(&manager).await, 1);
    assert!(manager.last_report().unwrap().is_noop());
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_reset_recovers_readiness_on_clean_slate() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ReplicaManager::new(common::config(dir.path()), common::manifest());
    manager.initialize().await.unwrap();
    insert_user(&manager, "u1").await;
    manager.persist().await.unwrap();

    assert!(manager.request_reset("verification failed").await.unwrap());
    assert_eq!(manager.phase(), ReplicaPhase::Uninitialized);
    assert_eq!(manager.resets().get(), 1);
    assert!(!manager.storage_dir().exists());

    manager.initialize().await.unwrap();
    assert_eq!(manager.phase(), ReplicaPhase::Ready);
    let report = manager.last_report().unwrap();
    assert!(report.previously_applied.is_none());
    assert_eq!(report.applied.len(), 2);
    assert_eq!(count_users(&manager).await, 0);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_preserve_mode_keeps_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path()).recovery(RecoveryMode::Preserve);
    let manager = ReplicaManager::new(config, common::manifest());
    manager.initialize().await.unwrap();

    assert!(!manager.request_reset("verification failed").await.unwrap());
    assert!(manager.replica_path().exists());
    assert!(manager.is_ready());
    assert_eq!(manager.resets().get(), 0);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_migration_wipes_storage() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = MigrationManifest::new(vec![
        MigrationRecord::from_sql(1, 100, "0000_users", "CREATE TABLE users (id TEXT PRIMARY KEY);"),
        MigrationRecord::from_sql(2, 200, "0001_broken", "CREATE TABLE broken (id TEXT"),
    ])
    .unwrap();
    let manager = ReplicaManager::new(common::config(dir.path()), manifest);

    let err = manager.initialize().await.unwrap_err();
    assert!(matches!(err, SyncError::Migration { ref tag, .. } if tag == "0001_broken"));
    assert_eq!(manager.phase(), ReplicaPhase::Uninitialized);
    assert_eq!(manager.resets().get(), 1);
    assert!(!manager.storage_dir().exists());
}

#[tokio::test]
async fn test_failed_migration_in_preserve_mode_keeps_error() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = MigrationManifest::new(vec![MigrationRecord::from_sql(
        1,
        100,
        "0000_broken",
        "CREATE TABLE broken (id TEXT",
    )])
    .unwrap();
    let config = common::config(dir.path()).recovery(RecoveryMode::Preserve);
    let manager = ReplicaManager::new(config, manifest);

    assert!(matches!(manager.initialize().await, Err(SyncError::Migration { .. })));
    assert!(manager.storage_dir().exists());
    assert_eq!(manager.resets().get(), 0);
}

fn seed_image(manager: &ReplicaManager, sql: &str) {
    std::fs::create_dir_all(manager.storage_dir()).unwrap();
    let conn = rusqlite::Connection::open(manager.replica_path()).unwrap();
    conn.execute_batch(sql).unwrap();
}

#[tokio::test]
async fn test_incompatible_bookkeeping_table_wipes_storage() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ReplicaManager::new(common::config(dir.path()), common::manifest());
    seed_image(
        &manager,
        "CREATE TABLE __replisync_migrations (id INTEGER PRIMARY KEY, hash TEXT, tag TEXT);",
    );

    let err = manager.initialize().await.unwrap_err();
    assert!(err.requires_reset(), "unexpected error: {err:?}");
    assert_eq!(manager.phase(), ReplicaPhase::Uninitialized);
    assert_eq!(manager.resets().get(), 1);
    assert!(!manager.replica_path().exists());

    manager.initialize().await.unwrap();
    assert_eq!(manager.phase(), ReplicaPhase::Ready);
    assert_eq!(manager.applied_migrations().await.unwrap().len(), 2);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_unreadable_image_wipes_storage() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ReplicaManager::new(common::config(dir.path()), common::manifest());
    std::fs::create_dir_all(manager.storage_dir()).unwrap();
    std::fs::write(manager.replica_path(), "not a database ".repeat(100)).unwrap();

    assert!(manager.initialize().await.unwrap_err().requires_reset());
    assert_eq!(manager.resets().get(), 1);
    assert!(!manager.replica_path().exists());

    manager.initialize().await.unwrap();
    assert!(manager.is_ready());
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_incompatible_image_in_preserve_mode_keeps_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path()).recovery(RecoveryMode::Preserve);
    let manager = ReplicaManager::new(config, common::manifest());
    seed_image(
        &manager,
        "CREATE TABLE __replisync_migrations (id INTEGER PRIMARY KEY, hash TEXT, tag TEXT);",
    );

    let err = manager.initialize().await.unwrap_err();
    assert!(err.to_string().contains("created_at"), "unexpected error: {err}");
    assert!(manager.replica_path().exists());
    assert_eq!(manager.resets().get(), 0);
}

#[tokio::test]
async fn test_inspect_applied_leaves_image_untouched() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = ReplicaManager::new(common::config(dir.path()), common::manifest());
        manager.initialize().await.unwrap();
        manager.close().await.unwrap();
    }

    let manager = ReplicaManager::new(common::config(dir.path()), MigrationManifest::empty());
    let before = std::fs::read(manager.replica_path()).unwrap();
    let applied = manager.inspect_applied().await.unwrap();
    assert_eq!(
        applied.iter().map(|m| m.tag.as_str()).collect::<Vec<_>>(),
        vec!["0000_users", "0001_chats"]
    );
    assert_eq!(std::fs::read(manager.replica_path()).unwrap(), before);
    assert_eq!(manager.phase(), ReplicaPhase::Uninitialized);
}

#[tokio::test]
async fn test_inspect_applied_on_image_without_bookkeeping() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ReplicaManager::new(common::config(dir.path()), MigrationManifest::empty());
    assert!(manager.inspect_applied().await.unwrap().is_empty());

    seed_image(&manager, "CREATE TABLE notes (id TEXT PRIMARY KEY);");
    let before = std::fs::read(manager.replica_path()).unwrap();
    assert!(manager.inspect_applied().await.unwrap().is_empty());
    assert_eq!(std::fs::read(manager.replica_path()).unwrap(), before);
}
