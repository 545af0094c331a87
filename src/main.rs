use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replisync::{MigrationManifest, RecoveryMode, ReplicaConfig, ReplicaManager};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replisync")]
#[command(about = "Developer tooling for replisync replicas")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a drizzle-style migrations folder into a manifest
    Compile {
        dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Open a replica and apply pending migrations
    Migrate {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        storage: PathBuf,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// List migrations applied to a replica
    Status {
        #[arg(long)]
        storage: PathBuf,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Delete a replica's durable files
    Reset {
        #[arg(long)]
        storage: PathBuf,
        #[arg(long)]
        namespace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Compile { dir, out } => compile(&dir, &out),
        Command::Migrate {
            manifest,
            storage,
            namespace,
        } => migrate(&manifest, storage, namespace.as_deref()).await,
        Command::Status { storage, namespace } => status(storage, namespace.as_deref()).await,
        Command::Reset { storage, namespace } => reset(storage, namespace.as_deref()).await,
    }
}

fn replica_config(storage: PathBuf, namespace: Option<&str>) -> ReplicaConfig {
    let config = ReplicaConfig::new(storage).recovery(RecoveryMode::Preserve);
    match namespace {
        Some(namespace) => config.namespace(namespace),
        None => config,
    }
}

fn compile(dir: &Path, out: &Path) -> Result<()> {
    let manifest = MigrationManifest::compile_dir(dir)
        .with_context(|| format!("Failed to compile migrations in '{}'", dir.display()))?;
    let json = manifest.to_json_pretty()?;

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory '{}'", parent.display()))?;
    }
    fs::write(out, json).with_context(|| format!("Failed to write manifest to '{}'", out.display()))?;

    println!("Compiled {} migrations into {}", manifest.len(), out.display());
    Ok(())
}

async fn migrate(manifest_path: &Path, storage: PathBuf, namespace: Option<&str>) -> Result<()> {
    let manifest = MigrationManifest::from_path(manifest_path)
        .with_context(|| format!("Failed to read manifest '{}'", manifest_path.display()))?;
    let manager = ReplicaManager::new(replica_config(storage, namespace), manifest);

    manager
        .initialize()
        .await
        .context("Failed to initialize replica")?;

    match manager.last_report() {
        Some(report) if !report.is_noop() => {
            for migration in &report.applied {
                println!("applied {} (when={})", migration.tag, migration.created_at);
            }
            println!(
                "{} migrations, {} statements",
                report.applied.len(),
                report.statements_executed
            );
        }
        _ => println!("Replica is up to date"),
    }

    manager.close().await?;
    Ok(())
}

async fn status(storage: PathBuf, namespace: Option<&str>) -> Result<()> {
    let manager = ReplicaManager::new(replica_config(storage, namespace), MigrationManifest::empty());
    if !manager.replica_path().exists() {
        println!("No replica at {}", manager.storage_dir().display());
        return Ok(());
    }

    let applied = manager
        .inspect_applied()
        .await
        .context("Failed to read replica")?;
    if applied.is_empty() {
        println!("No migrations applied");
    }
    for migration in applied {
        println!(
            "{:>4}  {:<40}  when={}  hash={}",
            migration.id, migration.tag, migration.created_at, migration.hash
        );
    }
    Ok(())
}

async fn reset(storage: PathBuf, namespace: Option<&str>) -> Result<()> {
    let manager = ReplicaManager::new(replica_config(storage, namespace), MigrationManifest::empty());
    let dir = manager.storage_dir();
    manager.destroy().await.context("Failed to reset replica")?;
    println!("Removed {}", dir.display());
    Ok(())
}
