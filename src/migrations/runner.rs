use serde::Serialize;
use tracing::{Instrument, Level, event, info_span};

use super::manifest::{MigrationManifest, MigrationRecord};
use crate::core::{Result, Row, SyncError};
use crate::replica::{EngineHandle, Statement, TxStep};

/// Table inside the replica recording applied migrations.
pub const MIGRATIONS_TABLE: &str = "__replisync_migrations";

/// A row of the applied-migrations table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub id: i64,
    pub hash: String,
    pub tag: String,
    pub created_at: i64,
}

impl AppliedMigration {
    fn from_row(row: &Row) -> Result<Self> {
        let missing = |column: &str| {
            SyncError::Engine(format!("{} row is missing '{}'", MIGRATIONS_TABLE, column))
        };
        Ok(Self {
            id: row.get_i64("id").ok_or_else(|| missing("id"))?,
            hash: row.get_str("hash").ok_or_else(|| missing("hash"))?.to_string(),
            tag: row.get_str("tag").ok_or_else(|| missing("tag"))?.to_string(),
            created_at: row.get_i64("created_at").ok_or_else(|| missing("created_at"))?,
        })
    }
}

/// Outcome of one `apply` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Latest row that existed before this run.
    pub previously_applied: Option<AppliedMigration>,
    /// Rows inserted by this run, in order.
    pub applied: Vec<AppliedMigration>,
    /// Manifest SQL statements executed by this run.
    pub statements_executed: usize,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

pub struct MigrationRunner<'a> {
    engine: &'a EngineHandle,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(engine: &'a EngineHandle) -> Self {
        Self { engine }
    }

    /// Brings the replica schema up to date with `manifest`.
    ///
    /// All pending migrations run in a single transaction. On failure nothing
    /// is committed and the error names the offending migration.
    pub async fn apply(&self, manifest: &MigrationManifest) -> Result<MigrationReport> {
        let span = info_span!("replica.migrations.apply", entries = manifest.len());
        self.apply_inner(manifest).instrument(span).await
    }

    async fn apply_inner(&self, manifest: &MigrationManifest) -> Result<MigrationReport> {
        self.ensure_table().await?;

        let previously_applied = self.latest().await?;
        let watermark = previously_applied.as_ref().map(|row| row.created_at);
        let pending = manifest.pending_after(watermark);

        if pending.is_empty() {
            event!(Level::DEBUG, watermark = ?watermark, "schema up to date");
            return Ok(MigrationReport {
                previously_applied,
                ..MigrationReport::default()
            });
        }

        let (steps, owners) = plan(&pending);
        let statements_executed = owners.iter().filter(|owner| owner.1).count();

        if let Err(err) = self.engine.transaction(steps).await {
            return Err(match err {
                SyncError::TransactionStep { index, message } => {
                    let tag = owners
                        .get(index)
                        .map(|(tag, _)| tag.clone())
                        .unwrap_or_default();
                    event!(Level::ERROR, tag = %tag, error = %message, "migration failed");
                    SyncError::Migration { tag, message }
                }
                other => other,
            });
        }

        for record in &pending {
            event!(
                Level::INFO,
                tag = %record.tag,
                when = record.when,
                statements = record.sql.len(),
                "migration applied"
            );
        }

        self.engine.persist().await?;

        let applied = self
            .applied_migrations()
            .await?
            .into_iter()
            .filter(|row| watermark.is_none_or(|latest| row.created_at > latest))
            .collect();

        Ok(MigrationReport {
            previously_applied,
            applied,
            statements_executed,
        })
    }

    /// Every applied migration, oldest first.
    pub async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        self.ensure_table().await?;
        let result = self
            .engine
            .query(Statement::raw(
                format!(
                    "SELECT id, hash, tag, created_at FROM {} ORDER BY created_at ASC, id ASC",
                    MIGRATIONS_TABLE
                ),
                vec![],
                [MIGRATIONS_TABLE],
            ))
            .await?;
        result.rows.iter().map(AppliedMigration::from_row).collect()
    }

    async fn ensure_table(&self) -> Result<()> {
        self.engine
            .execute(Statement::raw(
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     id INTEGER PRIMARY KEY AUTOINCREMENT, \
                     hash TEXT NOT NULL, \
                     tag TEXT NOT NULL, \
                     created_at BIGINT NOT NULL)",
                    MIGRATIONS_TABLE
                ),
                vec![],
                [MIGRATIONS_TABLE],
            ))
            .await?;
        Ok(())
    }

    async fn latest(&self) -> Result<Option<AppliedMigration>> {
        let result = self
            .engine
            .query(Statement::raw(
                format!(
                    "SELECT id, hash, tag, created_at FROM {} ORDER BY created_at DESC, id DESC LIMIT 1",
                    MIGRATIONS_TABLE
                ),
                vec![],
                [MIGRATIONS_TABLE],
            ))
            .await?;
        result.first().map(AppliedMigration::from_row).transpose()
    }
}

/// Flattens pending migrations into transaction steps. `owners[i]` names the
/// migration that step `i` belongs to and whether it is manifest SQL (as
/// opposed to the bookkeeping insert).
fn plan(pending: &[&MigrationRecord]) -> (Vec<TxStep>, Vec<(String, bool)>) {
    let mut steps = Vec::new();
    let mut owners = Vec::new();

    for record in pending {
        for sql in &record.sql {
            steps.push(TxStep::Batch(sql.clone()));
            owners.push((record.tag.clone(), true));
        }
        steps.push(TxStep::Statement(
            Statement::raw(
                format!(
                    "INSERT INTO {} (hash, tag, created_at) VALUES (?1, ?2, ?3)",
                    MIGRATIONS_TABLE
                ),
                vec![],
                [MIGRATIONS_TABLE],
            )
            .bind(record.hash.as_str())
            .bind(record.tag.as_str())
            .bind(record.when),
        ));
        owners.push((record.tag.clone(), false));
    }

    (steps, owners)
}
