// ============================================================================
// replisync: local-first embedded replica kept in sync by a change feed
// ============================================================================

pub mod config;
pub mod connectivity;
pub mod core;
pub mod hydration;
pub mod migrations;
pub mod replica;
pub mod runtime;
pub mod sync;

// Re-export main types for convenience
pub use config::{RecoveryMode, ReplicaConfig};
pub use core::{QueryResult, Result, Row, Signal, SignalSubscription, SyncError, Value};
pub use runtime::SyncRuntime;

// Re-export component APIs
pub use connectivity::{ConnectivityMonitor, Eligibility, EligibilityProbe, HttpEligibilityProbe, TickOutcome};
pub use hydration::{CacheKey, HydratableQuery, Hydrated, HydrationCache, HydrationState, Provenance, SsrSnapshot};
pub use migrations::{AppliedMigration, MigrationManifest, MigrationRecord, MigrationReport, MigrationRunner};
pub use replica::{
    Direction, EngineHandle, Filter, LiveQuery, QueryBuilder, ReplicaManager, ReplicaPhase, Statement,
};
pub use sync::{ChangeFeed, FeedEvent, HttpChangeFeed, MemoryChangeFeed, Synchronizer, TrackedTable};
