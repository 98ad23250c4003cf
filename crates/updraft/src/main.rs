mod commands;
mod error;
mod logging;
mod units;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use updraft_platform::AppPaths;

#[derive(Clone, Debug, Parser)]
#[command(name = "updraft", version = env!("CARGO_PKG_VERSION"), about, long_about = None, propagate_version = true)]
pub struct Cli {
    /// Units file to read instead of the one in the config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Only operate on this unit.
    #[arg(long, short, global = true)]
    pub unit: Option<String>,

    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Check each unit for a newer version.
    #[command(alias = "c")]
    Check,
    /// Show the server's metadata for a unit.
    #[command(alias = "i")]
    Info,
    /// Test connectivity and credentials against each unit's server.
    Connect,
    /// Run the health checks.
    Health,
    /// Show the last recorded status.
    Status,
    /// Verify and back up ahead of installing an available update.
    Prepare,
    /// Roll a unit back to a backup (the newest one by default).
    Restore { archive: Option<PathBuf> },
    /// List backups.
    #[command(alias = "ls")]
    Backups,
    /// Show each unit's recorded activity, newest last.
    Log {
        /// Number of entries to show per unit.
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
    },
    /// Add a unit to the units file.
    Add {
        #[arg(long)]
        server: String,
        #[arg(long = "id")]
        unit_id: String,
        #[arg(long = "current")]
        current_version: String,
        #[arg(long)]
        install_dir: PathBuf,
        #[arg(long)]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match AppPaths::new() {
        Ok(paths) => paths,
        Err(error) => {
            eprintln!("updraft: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = paths.ensure_dirs() {
        eprintln!("updraft: failed to create application directories: {error}");
        return ExitCode::FAILURE;
    }
    logging::init_logging(&paths.log_file(), cli.debug);

    match commands::run(&cli, &paths).await {
        Ok(code) => code,
        Err(error) => {
            log::error!("{error}");
            eprintln!("updraft: {error}");
            ExitCode::FAILURE
        }
    }
}
