pub mod manifest;
pub mod runner;

pub use manifest::{MigrationManifest, MigrationRecord, STATEMENT_BREAKPOINT};
pub use runner::{AppliedMigration, MIGRATIONS_TABLE, MigrationReport, MigrationRunner};
