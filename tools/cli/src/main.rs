//! MirrorSync CLI - keeps two record stores mirrored.
//!
//! Reads a JSON configuration naming the two stores and the shared record
//! schema, then runs sync passes between them, either continuously or once.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mirrorsync_storage::{create_default_registry, StoreAdapter};
use mirrorsync_sync::{Driver, Reconciler, SyncConfig, SyncReport};

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(about = "MirrorSync - Bidirectional last-write-wins record mirroring")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: <config dir>/mirrorsync/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll both stores until interrupted.
    Run,

    /// Run a single sync pass and exit.
    Once {
        /// Only consider records modified after this RFC 3339 instant.
        #[arg(long, conflicts_with = "lookback_seconds")]
        since: Option<DateTime<Utc>>,

        /// Only consider records modified in the last N seconds.
        #[arg(long)]
        lookback_seconds: Option<u64>,
    },

    /// Validate the configuration and check both stores are reachable.
    Check,

    /// Print shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => cmd_run(&load_config(cli.config)?).await,
        Commands::Once {
            since,
            lookback_seconds,
        } => cmd_once(&load_config(cli.config)?, since, lookback_seconds).await,
        Commands::Check => cmd_check(&load_config(cli.config)?).await,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "mirrorsync", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<SyncConfig> {
    let path = config_path(explicit)?;
    SyncConfig::load(&path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))
}

/// Resolve the configuration file location.
fn config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => {
            let dir = dirs::config_dir().context("No configuration directory on this platform")?;
            Ok(default_config_path(&dir))
        }
    }
}

fn default_config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("mirrorsync").join("config.json")
}

fn build_reconciler(config: &SyncConfig) -> Result<Reconciler> {
    let registry = create_default_registry().context("Failed to set up store adapters")?;
    config
        .build_reconciler(&registry)
        .context("Failed to open stores")
}

/// Poll until Ctrl-C.
async fn cmd_run(config: &SyncConfig) -> Result<()> {
    let reconciler = Arc::new(build_reconciler(config)?);
    let driver_config = config.driver_config()?;

    let (driver, task) = Driver::new(driver_config);
    let mut handle = tokio::spawn(task.run_reconciler(reconciler));

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, stopping");
            driver.shutdown();
            None
        }
        outcome = &mut handle => Some(outcome),
    };

    let outcome = match finished {
        Some(outcome) => outcome,
        None => handle.await,
    };
    outcome
        .context("Sync driver panicked")?
        .context("Sync driver stopped")?;

    Ok(())
}

/// Run one pass and print its report.
async fn cmd_once(
    config: &SyncConfig,
    since: Option<DateTime<Utc>>,
    lookback_seconds: Option<u64>,
) -> Result<()> {
    let cutoff = match (since, lookback_seconds) {
        (Some(since), _) => since,
        (None, Some(seconds)) => {
            let lookback = i64::try_from(seconds)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .context("Lookback is out of range")?;
            Utc::now() - lookback
        }
        (None, None) => Utc::now() - config.initial_lookback()?,
    };

    let reconciler = build_reconciler(config)?;
    info!("Running a single pass from {}", cutoff);

    let report = reconciler.run(cutoff).await.context("Sync pass failed")?;
    print_report(&report);

    Ok(())
}

/// Open both stores and fetch an empty window from each.
async fn cmd_check(config: &SyncConfig) -> Result<()> {
    let reconciler = build_reconciler(config)?;

    println!("Configuration OK");
    println!("  Identity field: {}", config.schema.identity_field);
    println!("  Timestamp field: {}", config.schema.timestamp_field);
    println!(
        "  Mirrored fields: {}",
        config.schema.mirrored_fields.join(", ")
    );

    let now = Utc::now();
    let mut reachable = true;
    for (role, store) in [
        ("Primary", reconciler.primary()),
        ("Secondary", reconciler.secondary()),
    ] {
        match probe(store.as_ref(), now).await {
            Ok(()) => println!("  {}: {} (reachable)", role, store.name()),
            Err(e) => {
                warn!("{} store check failed: {}", role, e);
                println!("  {}: {} (unreachable: {})", role, store.name(), e);
                reachable = false;
            }
        }
    }

    if !reachable {
        anyhow::bail!("One or more stores are unreachable");
    }
    Ok(())
}

async fn probe(store: &dyn StoreAdapter, now: DateTime<Utc>) -> mirrorsync_common::Result<()> {
    store.fetch_changes_since(now).await.map(|_| ())
}

fn print_report(report: &SyncReport) {
    println!("Sync pass completed in {:?}", report.duration);
    println!(
        "  Fetched: {} from primary, {} from secondary",
        report.primary_changes, report.secondary_changes
    );
    println!(
        "  Written: {} to primary, {} to secondary",
        report.written_to_primary, report.written_to_secondary
    );
    println!("  Skipped: {}", report.skipped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_once_since() {
        let cli = Cli::parse_from([
            "mirrorsync",
            "-c",
            "mirror.json",
            "once",
            "--since",
            "2015-05-08T23:09:00Z",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("mirror.json")));
        match cli.command {
            Commands::Once { since, .. } => {
                assert_eq!(since.unwrap().to_rfc3339(), "2015-05-08T23:09:00+00:00");
            }
            _ => panic!("expected once"),
        }
    }

    #[test]
    fn test_since_conflicts_with_lookback() {
        let result = Cli::try_parse_from([
            "mirrorsync",
            "once",
            "--since",
            "2015-05-08T23:09:00Z",
            "--lookback-seconds",
            "30",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path(Path::new("/home/user/.config"));
        assert_eq!(path, PathBuf::from("/home/user/.config/mirrorsync/config.json"));
    }

    #[tokio::test]
    async fn test_once_against_memory_stores() {
        let config = SyncConfig::from_json(
            r#"{
                "mirroredFields": ["title"],
                "primary": { "kind": "memory" },
                "secondary": { "kind": "memory" }
            }"#,
        )
        .unwrap();

        cmd_once(&config, None, Some(30)).await.unwrap();
        cmd_check(&config).await.unwrap();
    }
}
