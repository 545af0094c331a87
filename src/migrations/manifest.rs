use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Result, SyncError};

/// Marker drizzle-kit places between statements of one migration file.
pub const STATEMENT_BREAKPOINT: &str = "--> statement-breakpoint";

/// One compiled migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub idx: u32,
    /// Logical timestamp; also what gets stored as `created_at` once applied.
    pub when: i64,
    pub tag: String,
    pub hash: String,
    pub sql: Vec<String>,
}

impl MigrationRecord {
    /// Builds a record from raw SQL text, splitting on statement breakpoints
    /// and deriving the content hash.
    pub fn from_sql(idx: u32, when: i64, tag: &str, sql_text: &str) -> Self {
        let sql = split_statements(sql_text);
        Self {
            idx,
            when,
            tag: tag.to_string(),
            hash: content_hash(sql_text),
            sql,
        }
    }
}

/// Ordered, validated list of migrations. Serialises as a bare JSON array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationManifest {
    entries: Vec<MigrationRecord>,
}

#[derive(Debug, Deserialize)]
struct Journal {
    entries: Vec<JournalEntry>,
}

#[derive(Debug, Deserialize)]
struct JournalEntry {
    idx: u32,
    when: i64,
    tag: String,
}

impl MigrationManifest {
    pub fn new(entries: Vec<MigrationRecord>) -> Result<Self> {
        let manifest = Self { entries };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json)
            .map_err(|err| SyncError::InvalidManifest(err.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|err| {
            SyncError::InvalidManifest(format!("cannot read '{}': {}", path.display(), err))
        })?;
        Self::from_json(&json)
    }

    /// Compiles a drizzle-kit migrations folder: `meta/_journal.json` plus
    /// one `<tag>.sql` file per journal entry.
    pub fn compile_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let journal_path = dir.join("meta").join("_journal.json");
        let journal_text = fs::read_to_string(&journal_path).map_err(|err| {
            SyncError::InvalidManifest(format!(
                "cannot read journal '{}': {}",
                journal_path.display(),
                err
            ))
        })?;
        let journal: Journal = serde_json::from_str(&journal_text)
            .map_err(|err| SyncError::InvalidManifest(format!("malformed journal: {}", err)))?;

        let mut entries = Vec::with_capacity(journal.entries.len());
        for entry in journal.entries {
            let sql_path = dir.join(format!("{}.sql", entry.tag));
            let sql_text = fs::read_to_string(&sql_path).map_err(|err| {
                SyncError::InvalidManifest(format!(
                    "cannot read migration '{}': {}",
                    sql_path.display(),
                    err
                ))
            })?;
            entries.push(MigrationRecord::from_sql(
                entry.idx, entry.when, &entry.tag, &sql_text,
            ));
        }

        Self::new(entries)
    }

    pub fn validate(&self) -> Result<()> {
        for record in &self.entries {
            if record.tag.trim().is_empty() {
                return Err(SyncError::InvalidManifest(format!(
                    "migration {} has an empty tag",
                    record.idx
                )));
            }
            if record.hash.trim().is_empty() {
                return Err(SyncError::InvalidManifest(format!(
                    "migration '{}' has an empty hash",
                    record.tag
                )));
            }
        }

        for pair in self.entries.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.idx <= prev.idx {
                return Err(SyncError::InvalidManifest(format!(
                    "idx must be strictly ascending: '{}' ({}) follows '{}' ({})",
                    next.tag, next.idx, prev.tag, prev.idx
                )));
            }
            if next.when <= prev.when {
                return Err(SyncError::InvalidManifest(format!(
                    "when must be strictly ascending: '{}' ({}) follows '{}' ({})",
                    next.tag, next.when, prev.tag, prev.when
                )));
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[MigrationRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose `when` is strictly greater than `watermark`, in index
    /// order. `None` means nothing was applied yet.
    pub fn pending_after(&self, watermark: Option<i64>) -> Vec<&MigrationRecord> {
        self.entries
            .iter()
            .filter(|record| watermark.is_none_or(|latest| record.when > latest))
            .collect()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn split_statements(sql_text: &str) -> Vec<String> {
    sql_text
        .split(STATEMENT_BREAKPOINT)
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}

fn content_hash(sql_text: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, sql_text.as_bytes()).to_string()
}
