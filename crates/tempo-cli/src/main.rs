mod commands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tempo_core::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "tempo", version)]
#[command(about = "Local activity telemetry engine", long_about = None)]
struct Cli {
    /// Config file (defaults to <config_dir>/tempo/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store file, overriding `db_path` from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sample the foreground application until Ctrl-C
    Run {
        /// Log to <data_dir>/tempo.log instead of stderr
        #[arg(long)]
        log_file: bool,
    },
    /// Roll up completed periods and compact expired raw data now
    Aggregate,
    /// Write a consistent point-in-time copy of the store
    Backup {
        /// Destination file; must not exist
        target: PathBuf,
    },
    /// Close sessions left open by an unclean shutdown
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Run { log_file: true }) {
        commands::daemon::setup_file_logging()?;
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    }

    let config = load_config(cli.config.as_deref(), cli.db)?;

    match cli.command {
        Commands::Run { .. } => commands::daemon::run(config).await,
        Commands::Aggregate => commands::data::aggregate(&config),
        Commands::Backup { target } => commands::data::backup(&config, &target),
        Commands::Recover => commands::data::recover(&config),
    }
}

fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(path).context("Failed to load configuration")?;
    if db.is_some() {
        config.db_path = db;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
