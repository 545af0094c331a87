#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use replisync::{
    Eligibility, EligibilityProbe, MigrationManifest, MigrationRecord, RecoveryMode, ReplicaConfig, Result,
    SyncError, TrackedTable,
};

pub fn manifest() -> MigrationManifest {
    MigrationManifest::new(vec![
        MigrationRecord::from_sql(
            1,
            100,
            "0000_users",
            "CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT, user_id TEXT);",
        ),
        MigrationRecord::from_sql(
            2,
            200,
            "0001_chats",
            "CREATE TABLE chats (id TEXT PRIMARY KEY, user_id TEXT NOT NULL, title TEXT, archived INTEGER NOT NULL DEFAULT 0);\n--> statement-breakpoint\nCREATE INDEX chats_user_idx ON chats (user_id);",
        ),
    ])
    .unwrap()
}

pub fn tables() -> Vec<TrackedTable> {
    vec![
        TrackedTable::new("users", &["id"]),
        TrackedTable::new("chats", &["id"]).columns(&["id", "user_id", "title", "archived"]),
    ]
}

/// Fast timings so the loops settle within a test.
pub fn config(dir: &Path) -> ReplicaConfig {
    ReplicaConfig::new(dir)
        .namespace("test")
        .poll_interval(Duration::from_millis(20))
        .catch_up_poll_interval(Duration::from_millis(5))
        .verification(3, Duration::from_millis(5))
        .recovery(RecoveryMode::Reset)
}

/// Eligibility probe that replays scripted answers, then repeats `fallback`.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Result<Eligibility>>>,
    fallback: Result<Eligibility>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn always(answer: Result<Eligibility>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn offline() -> Self {
        Self::always(Err(SyncError::Transport("connection refused".into())))
    }

    pub fn then(self, answer: Result<Eligibility>) -> Self {
        self.script.lock().unwrap().push_back(answer);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EligibilityProbe for ScriptedProbe {
    async fn check(&self) -> Result<Eligibility> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
