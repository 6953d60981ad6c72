use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod apt;
mod control;
mod database;
mod prune;
mod run;
mod upload;

use database::{Database, DB_BATCH_SIZE};
use run::RunFlags;
use upload::Uploader;

#[derive(Parser, Debug)]
#[command(version, about = "Fetch, analyze and publish source packages")]
struct Cli {
    /// Path to the distribution configuration file
    #[arg(long, default_value = "distributions.toml", global = true)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every configured distribution
    Publish(PublishArgs),
    /// Delete stale artifacts from the `ls` bucket
    Prune,
}

#[derive(Args, Debug)]
struct PublishArgs {
    /// Reprocess every package even when its version and epoch are current
    #[arg(long)]
    reindex_packages: bool,
    /// Rebuild consolidated indexes even when no package changed
    #[arg(long)]
    reindex_distros: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match main_inner() {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = ?err, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn main_inner() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = sift_internal::load_config(&cli.config)?;
    let epoch = config.epoch();

    // The DATABASE env var points at the metadata store.
    let db_path = env::var("DATABASE")
        .map_err(|_| anyhow!("expected a database path in DATABASE"))?;
    let db = Database::connect(&PathBuf::from(db_path), DB_BATCH_SIZE)
        .context("failed to open database")?;
    tracing::info!("database ready");

    let uploader = Uploader::from_env(epoch).context("failed to open buckets")?;
    tracing::info!("buckets ready");

    match cli.command {
        Command::Publish(args) => {
            let flags = RunFlags {
                reindex_pkgs: args.reindex_packages,
                reindex_distro: args.reindex_distros,
            };
            let mut errored = false;
            for (name, distro) in &config.distributions {
                if run::process_distro(&db, &uploader, name, distro, epoch, flags) {
                    errored = true;
                }
            }
            if errored {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Command::Prune => {
            let distros: HashSet<String> = config.distributions.keys().cloned().collect();
            prune::run(&uploader, &distros, epoch)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
