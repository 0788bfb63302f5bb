// pipestore - embedded metrics/events store for audio pipelines
//
// Binary entry point: parse the CLI, load configuration, set up logging and
// dispatch to the command handlers in cli.rs.

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config commands must work even when the config file is broken
    if let Commands::Config { show, path, init } = cli.command {
        return cli::handle_config(&cli, show, path, init);
    }

    let config = cli.load_config()?;

    // Guard flushes the file appender on drop; keep it for the whole run
    let _log_guard = pipestore::logging::init(&config.logging);

    tracing::debug!(
        db_path = %config.store.db_path.display(),
        "Configuration loaded"
    );

    match cli.command {
        Commands::Migrate { to } => cli::handle_migrate(&config, to),
        Commands::Rollback { to } => cli::handle_rollback(&config, to),
        Commands::Status => cli::handle_status(&config),
        Commands::Cleanup => cli::handle_cleanup(&config),
        Commands::Stats => cli::handle_stats(&config),
        Commands::Run => cli::handle_run(&config).await,
        Commands::Config { .. } => Ok(()),
    }
}
