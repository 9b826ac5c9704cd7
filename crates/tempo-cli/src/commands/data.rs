//! Store maintenance commands
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tempo_core::{Aggregator, EngineConfig};
use tempo_storage::{Database, Granularity, StoreError};

use super::helpers::format_duration;

/// Maintenance needs the writer lock, so it is refused while `tempo run`
/// is recording into the same store
fn open_store(config: &EngineConfig) -> Result<Database> {
    match Database::open_with_timeout(config.db_path.clone(), config.store_lock_timeout()) {
        Err(StoreError::Locked(path)) => bail!(
            "{} is in use by a running tracker; stop `tempo run` first",
            path.display()
        ),
        other => other.context("Failed to open store"),
    }
}

pub fn aggregate(config: &EngineConfig) -> Result<()> {
    let db = Arc::new(open_store(config)?);
    let aggregator = Aggregator::new(db, config)?;

    let now = Utc::now();
    let report = aggregator.run_pass(now).context("Aggregation failed")?;
    println!(
        "Rolled up {} period(s); compacted {} session(s) and {} idle gap(s)",
        report.periods_rolled,
        report.compaction.sessions_deleted,
        report.compaction.idle_gaps_deleted
    );

    let today = aggregator.summarize(Granularity::Day, now)?;
    println!(
        "Today: {} tracked, productivity {}/100",
        format_duration(today.total_seconds),
        today.productivity_index
    );
    for progress in aggregator.evaluate_goals(now)? {
        println!(
            "Goal {} {}: {} min of {} ({})",
            progress.goal.kind.as_str(),
            progress.goal.scope.as_deref().unwrap_or("productive"),
            progress.actual_minutes,
            progress.goal.target_value,
            if progress.met { "met" } else { "not met" }
        );
    }
    Ok(())
}

pub fn backup(config: &EngineConfig, target: &Path) -> Result<()> {
    let db = open_store(config)?;
    db.backup_to(target)
        .with_context(|| format!("Backup to {} failed", target.display()))?;
    println!("Store copied to {}", target.display());
    Ok(())
}

pub fn recover(config: &EngineConfig) -> Result<()> {
    let db = open_store(config)?;
    let recovered = db.recover_open_sessions()?;
    println!("Closed {recovered} session(s) left open");
    Ok(())
}
