use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::{Result, SyncError};

/// What to do with durable replica state after a fatal migration or
/// verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Wipe the persisted replica and rebuild from scratch.
    Reset,
    /// Keep the files and propagate the raw error.
    Preserve,
}

impl Default for RecoveryMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Preserve
        } else {
            Self::Reset
        }
    }
}

impl RecoveryMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reset" => Some(Self::Reset),
            "preserve" => Some(Self::Preserve),
            _ => None,
        }
    }
}

/// Replica configuration
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Root directory for durable replica storage
    pub storage_dir: PathBuf,

    /// Storage namespace; `destroy()` removes `storage_dir/namespace`
    pub namespace: String,

    /// Base URL for the change-feed and eligibility endpoints
    pub server_url: String,

    pub feed_path: String,

    pub status_path: String,

    /// Bearer token forwarded on every request
    pub auth_token: Option<String>,

    /// Connectivity monitor tick
    pub poll_interval: Duration,

    /// How often the synchronizer checks whether every table caught up
    pub catch_up_poll_interval: Duration,

    pub verification_attempts: u32,

    pub verification_delay: Duration,

    /// Table and key column queried to verify the replica after sync
    pub verification_table: String,
    pub verification_key: String,

    /// Column used to scope change feeds to the signed-in user
    pub owner_column: String,

    pub request_timeout: Duration,

    pub recovery: RecoveryMode,

    /// Idle hydration entries older than this are evicted
    pub hydration_idle_ttl: Option<Duration>,

    /// Maximum number of idle hydration entries kept around
    pub hydration_idle_capacity: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./.replisync"),
            namespace: "replica".to_string(),
            server_url: "http://localhost:3000".to_string(),
            feed_path: "/api/sync/v1/shape".to_string(),
            status_path: "/api/sync/status".to_string(),
            auth_token: None,
            poll_interval: Duration::from_secs(5),
            catch_up_poll_interval: Duration::from_millis(100),
            verification_attempts: 5,
            verification_delay: Duration::from_millis(200),
            verification_table: "users".to_string(),
            verification_key: "id".to_string(),
            owner_column: "user_id".to_string(),
            request_timeout: Duration::from_secs(30),
            recovery: RecoveryMode::default(),
            hydration_idle_ttl: Some(Duration::from_secs(600)), // 10 minutes
            hydration_idle_capacity: 256,
        }
    }
}

impl ReplicaConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn server_url(mut self, url: &str) -> Self {
        self.server_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn feed_path(mut self, path: &str) -> Self {
        self.feed_path = path.to_string();
        self
    }

    pub fn status_path(mut self, path: &str) -> Self {
        self.status_path = path.to_string();
        self
    }

    pub fn auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_string());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn catch_up_poll_interval(mut self, interval: Duration) -> Self {
        self.catch_up_poll_interval = interval;
        self
    }

    pub fn verification(mut self, attempts: u32, delay: Duration) -> Self {
        self.verification_attempts = attempts;
        self.verification_delay = delay;
        self
    }

    pub fn verification_target(mut self, table: &str, key: &str) -> Self {
        self.verification_table = table.to_string();
        self.verification_key = key.to_string();
        self
    }

    pub fn owner_column(mut self, column: &str) -> Self {
        self.owner_column = column.to_string();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn recovery(mut self, mode: RecoveryMode) -> Self {
        self.recovery = mode;
        self
    }

    pub fn hydration_idle_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.hydration_idle_ttl = ttl;
        self
    }

    pub fn hydration_idle_capacity(mut self, capacity: usize) -> Self {
        self.hydration_idle_capacity = capacity;
        self
    }

    /// Directory holding this replica's durable files.
    pub fn namespace_dir(&self) -> PathBuf {
        self.storage_dir.join(&self.namespace)
    }

    pub fn feed_url(&self) -> String {
        join_url(&self.server_url, &self.feed_path)
    }

    pub fn status_url(&self) -> String {
        join_url(&self.server_url, &self.status_path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(SyncError::InvalidConfig("namespace must not be empty".into()));
        }
        if self.namespace.contains(['/', '\\']) || self.namespace == ".." || self.namespace == "." {
            return Err(SyncError::InvalidConfig(format!(
                "namespace '{}' must be a single path component",
                self.namespace
            )));
        }
        if self.poll_interval.is_zero() || self.catch_up_poll_interval.is_zero() {
            return Err(SyncError::InvalidConfig("poll intervals must be non-zero".into()));
        }
        if self.verification_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "verification_attempts must be at least 1".into(),
            ));
        }
        if self.hydration_idle_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "hydration_idle_capacity must be at least 1".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(SyncError::InvalidConfig("request_timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Defaults overlaid with `REPLISYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("REPLISYNC_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(namespace) = lookup("REPLISYNC_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(url) = lookup("REPLISYNC_SERVER_URL") {
            config = config.server_url(&url);
        }
        if let Some(token) = lookup("REPLISYNC_AUTH_TOKEN") {
            config.auth_token = Some(token);
        }
        if let Some(ms) = lookup("REPLISYNC_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_number("REPLISYNC_POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(ms) = lookup("REPLISYNC_REQUEST_TIMEOUT_MS") {
            config.request_timeout =
                Duration::from_millis(parse_number("REPLISYNC_REQUEST_TIMEOUT_MS", &ms)?);
        }
        if let Some(mode) = lookup("REPLISYNC_RECOVERY") {
            config.recovery = RecoveryMode::parse(&mode).ok_or_else(|| {
                SyncError::InvalidConfig(format!("REPLISYNC_RECOVERY: unknown mode '{}'", mode))
            })?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| SyncError::InvalidConfig(format!("{}: '{}' is not a number", key, raw)))
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}
