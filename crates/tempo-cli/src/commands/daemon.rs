/// Engine lifecycle commands
use anyhow::{Context, Result};
use tempo_core::{config::get_data_dir, Daemon, EngineConfig};

use super::helpers::format_duration;

pub async fn run(config: EngineConfig) -> Result<()> {
    let daemon = Daemon::open(config).context("Failed to start engine")?;
    let summary = daemon.run_with_signals().await?;

    let totals = summary.totals;
    log::info!(
        "Run covered {}: {} in sessions, {} idle, {} switching, {} discarded",
        format_duration(totals.span_seconds()),
        format_duration(totals.session_seconds),
        format_duration(totals.idle_seconds),
        format_duration(totals.switch_seconds),
        format_duration(totals.discarded_seconds)
    );
    if summary.health.degraded {
        log::warn!(
            "Probes were still failing at shutdown ({} consecutive failures)",
            summary.health.consecutive_failures
        );
    }
    Ok(())
}

pub fn setup_file_logging() -> Result<()> {
    use std::fs::{create_dir_all, OpenOptions};

    let log_path = get_data_dir()?.join("tempo.log");

    if let Some(parent) = log_path.parent() {
        create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();

    Ok(())
}
