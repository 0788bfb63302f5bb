// CLI module - command-line argument parsing and handlers
//
// Maintenance subcommands operate on the store named by the effective
// configuration (--config file > ~/.config/pipestore/config.toml, then
// PIPESTORE_* env vars). `run` keeps the store open with its background
// components until Ctrl-C.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pipestore::config::{Config, VERSION};
use pipestore::store::{MetricsStore, MigrationEngine, MigrationReport, SessionIndex};
use std::path::PathBuf;
use std::sync::Arc;

/// pipestore - metrics and session store for audio pipelines
#[derive(Parser)]
#[command(name = "pipestore")]
#[command(version = VERSION)]
#[command(about = "Embedded metrics/events store for audio pipelines", long_about = None)]
pub struct Cli {
    /// Config file to use instead of ~/.config/pipestore/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Migrate the schema (to the latest version unless --to is given)
    Migrate {
        #[arg(long)]
        to: Option<u32>,
    },

    /// Roll the schema back one version, or down to --to
    Rollback {
        #[arg(long)]
        to: Option<u32>,
    },

    /// Show applied and pending migrations and available backups
    Status,

    /// Run every retention policy once
    Cleanup,

    /// Show row counts, schema version and session analytics
    Stats,

    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,

        /// Write a default config file (refuses to overwrite)
        #[arg(long)]
        init: bool,
    },

    /// Open the store with batching, retention and the session sweeper
    /// running until Ctrl-C
    Run,
}

impl Cli {
    /// Effective configuration for this invocation
    pub fn load_config(&self) -> Result<Config> {
        Config::load_from(self.config.as_deref()).context("failed to load configuration")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Schema commands
// ─────────────────────────────────────────────────────────────────────────────

fn open_engine(config: &Config) -> Result<MigrationEngine> {
    MigrationEngine::open(&config.store, &config.backup).with_context(|| {
        format!(
            "failed to open store at {}",
            config.store.db_path.display()
        )
    })
}

fn print_report(verb: &str, report: &MigrationReport) {
    if report.is_noop() {
        println!("Schema already at v{}, nothing to {}", report.to, verb);
        return;
    }
    println!(
        "Schema v{} -> v{} ({} step(s): {:?})",
        report.from,
        report.to,
        report.steps.len(),
        report.steps
    );
    if let Some(backup) = &report.backup {
        println!("Backup: {}", backup.display());
    }
}

pub fn handle_migrate(config: &Config, to: Option<u32>) -> Result<()> {
    let mut engine = open_engine(config)?;
    let report = match to {
        Some(version) => engine.migrate_to(version)?,
        None => engine.migrate()?,
    };
    print_report("migrate", &report);
    Ok(())
}

pub fn handle_rollback(config: &Config, to: Option<u32>) -> Result<()> {
    let mut engine = open_engine(config)?;
    let report = match to {
        Some(version) => engine.rollback_to(version)?,
        None => engine.rollback()?,
    };
    print_report("roll back", &report);
    Ok(())
}

pub fn handle_status(config: &Config) -> Result<()> {
    let engine = open_engine(config)?;
    let status = engine.status()?;

    println!("Store:   {}", config.store.db_path.display());
    println!("Schema:  v{} (latest v{})", status.current, status.latest);
    println!();
    println!("Applied:");
    if status.applied.is_empty() {
        println!("  (none)");
    }
    for m in &status.applied {
        println!(
            "  v{:<3} {:<28} {}  {}",
            m.version,
            m.name,
            m.applied_at,
            &m.checksum[..m.checksum.len().min(12)]
        );
    }

    if !status.pending.is_empty() {
        println!();
        println!("Pending:");
        for (version, name) in &status.pending {
            println!("  v{:<3} {}", version, name);
        }
    }

    if let Err(e) = engine.validate() {
        println!();
        println!("WARNING: {}", e);
    }

    let backups = engine.backups()?;
    if !backups.is_empty() {
        println!();
        println!("Backups (newest first):");
        for path in backups {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Store commands
// ─────────────────────────────────────────────────────────────────────────────

/// Open the store for a one-shot command: no batching, no schedulers
fn open_oneshot(config: &Config) -> Result<MetricsStore> {
    let mut config = config.clone();
    config.batch.enabled = false;
    config.retention.enabled = false;
    MetricsStore::open(&config).context("failed to open metrics store")
}

pub fn handle_cleanup(config: &Config) -> Result<()> {
    let store = open_oneshot(config)?;
    let report = store.run_cleanup()?;

    for result in &report.results {
        match &result.error {
            None => println!(
                "  {:<24} found {:>8}  cleaned {:>8}  ({:?})",
                result.policy, result.found, result.cleaned, result.duration
            ),
            Some(e) => println!("  {:<24} FAILED: {}", result.policy, e),
        }
    }
    println!(
        "Cleaned {} row(s) in {:?}",
        report.total_cleaned(),
        report.duration
    );

    store.close()?;
    let failures = report.failures().count();
    if failures > 0 {
        bail!("{} retention policy(ies) failed", failures);
    }
    Ok(())
}

pub fn handle_stats(config: &Config) -> Result<()> {
    let store = open_oneshot(config)?;
    let stats = store.stats()?;
    let analytics = store.session_analytics()?;

    println!("Schema version:   v{}", stats.schema_version);
    println!("Metrics:          {}", stats.metrics_rows);
    println!("Events:           {}", stats.events_rows);
    println!(
        "Sessions:         {} ({} open)",
        stats.session_rows, stats.open_sessions
    );
    println!();
    println!(
        "Outcomes:         {} completed, {} failed, {} cancelled, {} timed out",
        analytics.completed, analytics.failed, analytics.cancelled, analytics.timed_out
    );
    if let Some(avg) = analytics.avg_duration_secs {
        println!("Avg duration:     {:.1}s", avg);
    }
    println!(
        "Errors/session:   {:.2} (recovery rate {:.0}%)",
        analytics.health.error_rate(),
        analytics.health.recovery_rate() * 100.0
    );

    store.close()?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Long-running mode
// ─────────────────────────────────────────────────────────────────────────────

pub async fn handle_run(config: &Config) -> Result<()> {
    let store = Arc::new(MetricsStore::open(config).context("failed to open metrics store")?);
    let sessions = SessionIndex::start(store.clone(), config.sessions.clone())?;

    tracing::info!(
        open_sessions = sessions.len(),
        "Store running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down...");
    if let Err(e) = sessions.stop(config.batch.shutdown_timeout()) {
        tracing::error!("Session index shutdown error: {}", e);
    }
    store.close()?;
    tracing::info!("Shutdown complete");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Config commands
// ─────────────────────────────────────────────────────────────────────────────

pub fn handle_config(cli: &Cli, show: bool, path: bool, init: bool) -> Result<()> {
    let config_path = match &cli.config {
        Some(p) => p.clone(),
        None => Config::config_path().context("could not determine config path")?,
    };

    if path {
        println!("{}", config_path.display());
    } else if show {
        let config = cli.load_config()?;
        println!("# Effective configuration (env > file > defaults)");
        if config_path.exists() {
            println!("# Source: {}", config_path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
        println!();
        print!("{}", config.to_toml());
    } else if init {
        if config_path.exists() {
            bail!("config file already exists: {}", config_path.display());
        }
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&config_path, Config::default().to_toml())
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        println!("Wrote default config: {}", config_path.display());
    } else {
        println!("Usage: pipestore config [--show|--path|--init]");
        println!();
        println!("Options:");
        println!("  --show    Display effective configuration");
        println!("  --path    Show config file path");
        println!("  --init    Write a default config file");
    }
    Ok(())
}
