//! Multi-resolution rollups, raw-data compaction and productivity scoring.
//!
//! Closed sessions are rolled into hour/day/week/month aggregates per
//! application and per category. Once every granularity has covered a span
//! and it is older than the retention window, its raw sessions are deleted
//! and the aggregates become the only record of it.

mod periods;


use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tempo_storage::{
    rolled_through_key, Compaction, Database, Goal, GoalKind, Granularity, PeriodRollup,
    PeriodStat, SessionQuery, SessionRecord, StatScope, COMPACTED_THROUGH,
};

use crate::categorizer::canonical_name;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

pub use periods::{ceil_to_period, next_period_start, period_start};

/// Apps listed in a [`PeriodSummary`]
const TOP_APPS: usize = 5;

/// Outcome of one aggregation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub periods_rolled: usize,
    pub compaction: Compaction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppUsage {
    pub app_id: i64,
    pub name: String,
    pub seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryUsage {
    pub category_id: i64,
    pub name: String,
    pub seconds: i64,
    pub score_seconds: f64,
}

/// Totals for one period, from stored aggregates or, for a period not yet
/// rolled up, straight from raw sessions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSummary {
    pub granularity: Granularity,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_seconds: i64,
    pub productive_seconds: i64,
    pub distracting_seconds: i64,
    pub idle_seconds: i64,
    pub session_count: u32,
    /// 0..=100, 50 is neutral
    pub productivity_index: u8,
    pub top_apps: Vec<AppUsage>,
    pub categories: Vec<CategoryUsage>,
    /// False when computed from raw sessions
    pub rolled_up: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalProgress {
    pub goal: Goal,
    pub actual_minutes: i64,
    pub met: bool,
}

/// `round(((score_seconds / total) + 1) / 2 * 100)`, or 0 when nothing was
/// tracked
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn productivity_index(score_seconds: f64, total_seconds: i64) -> u8 {
    if total_seconds <= 0 {
        return 0;
    }
    let weighted = (score_seconds / total_seconds as f64).clamp(-1.0, 1.0);
    (((weighted + 1.0) / 2.0) * 100.0).round() as u8
}

#[derive(Clone)]
pub struct Aggregator {
    db: Arc<Database>,
    offset: FixedOffset,
    retention: chrono::Duration,
    /// Recent history that transitions still in flight may change
    settle: chrono::Duration,
}

impl Aggregator {
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for an out-of-range UTC offset
    pub fn new(db: Arc<Database>, config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            db,
            offset: config.utc_offset()?,
            retention: chrono::Duration::days(i64::from(config.raw_retention_days)),
            settle: chrono::Duration::seconds(
                i64::try_from(config.debounce_window_secs + 2 * config.sample_interval_secs)
                    .unwrap_or(i64::MAX),
            ),
        })
    }

    /// Roll up every completed period of every granularity, then compact
    /// raw data past retention
    ///
    /// # Errors
    ///
    /// Returns `Store` if a query or transaction fails; completed steps stay
    /// committed and the next pass resumes from the watermarks
    pub fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let settled = now - self.settle;
        let horizon = match self.db.earliest_open_session_start()? {
            Some(open) => open.min(settled),
            None => settled,
        };

        let mut report = PassReport::default();
        for granularity in Granularity::ALL {
            report.periods_rolled += self.roll_up(granularity, horizon)?;
        }
        report.compaction = self.compact(now)?;

        if report.periods_rolled > 0 {
            log::info!(
                "Aggregation pass rolled {} period(s) through {horizon}",
                report.periods_rolled
            );
        }
        Ok(report)
    }

    /// Roll up completed `granularity` periods ending at or before `horizon`.
    /// Returns how many periods were written.
    ///
    /// # Errors
    ///
    /// Returns `Store` if a query or the rollup transaction fails
    pub fn roll_up(&self, granularity: Granularity, horizon: DateTime<Utc>) -> Result<usize> {
        let Some(mut start) = self.resume_point(granularity)? else {
            return Ok(0);
        };

        let mut bounds = Vec::new();
        while let Some(end) = next_period_start(granularity, start, self.offset) {
            if end > horizon {
                break;
            }
            bounds.push((start, end));
            start = end;
        }
        let (Some(&(first, _)), Some(&(_, last))) = (bounds.first(), bounds.last()) else {
            return Ok(0);
        };

        let records = self.db.get_sessions(&SessionQuery::range(first, last))?;
        let rollups: Vec<PeriodRollup> = bounds
            .iter()
            .map(|&(start, end)| build_rollup(granularity, start, end, &records))
            .collect();

        self.db.replace_periods(granularity, &rollups, last)?;
        Ok(rollups.len())
    }

    /// Delete raw data that is older than the retention window and covered
    /// by every granularity's rollups
    ///
    /// # Errors
    ///
    /// Returns `Store` if the compaction transaction fails
    pub fn compact(&self, now: DateTime<Utc>) -> Result<Compaction> {
        let mut cutoff = now - self.retention;
        for granularity in Granularity::ALL {
            match self.db.get_watermark(&rolled_through_key(granularity))? {
                Some(rolled) => cutoff = cutoff.min(rolled),
                None => return Ok(Compaction::default()),
            }
        }
        if self
            .db
            .get_watermark(COMPACTED_THROUGH)?
            .is_some_and(|compacted| compacted >= cutoff)
        {
            return Ok(Compaction::default());
        }
        Ok(self.db.compact_through(cutoff)?)
    }

    /// Summarize the period of `granularity` containing `at`
    ///
    /// # Errors
    ///
    /// Returns `Store` if a query fails
    pub fn summarize(&self, granularity: Granularity, at: DateTime<Utc>) -> Result<PeriodSummary> {
        let (rollup, rolled_up) = self.period_rollup(granularity, at)?;

        let categories = self.db.get_categories()?;
        let mut summary = PeriodSummary {
            granularity,
            period_start: rollup.period_start,
            period_end: rollup.period_end,
            total_seconds: 0,
            productive_seconds: 0,
            distracting_seconds: 0,
            idle_seconds: 0,
            session_count: 0,
            productivity_index: 0,
            top_apps: Vec::new(),
            categories: Vec::new(),
            rolled_up,
        };

        let mut score_seconds = 0.0;
        for stat in &rollup.stats {
            match stat.scope {
                StatScope::Category(category_id) => {
                    summary.total_seconds += stat.total_seconds;
                    summary.productive_seconds += stat.productive_seconds;
                    summary.distracting_seconds += stat.distracting_seconds;
                    summary.idle_seconds += stat.idle_seconds;
                    summary.session_count += stat.session_count;
                    score_seconds += stat.score_seconds;

                    let name = categories
                        .iter()
                        .find(|c| c.id == category_id)
                        .map_or_else(|| format!("category {category_id}"), |c| c.name.clone());
                    summary.categories.push(CategoryUsage {
                        category_id,
                        name,
                        seconds: stat.total_seconds,
                        score_seconds: stat.score_seconds,
                    });
                }
                StatScope::App(app_id) => {
                    let name = self
                        .db
                        .get_application_by_id(app_id)?
                        .map_or_else(|| format!("app {app_id}"), |a| a.display_name);
                    summary.top_apps.push(AppUsage {
                        app_id,
                        name,
                        seconds: stat.total_seconds,
                    });
                }
            }
        }

        summary.productivity_index = productivity_index(score_seconds, summary.total_seconds);
        summary.categories.sort_by_key(|c| Reverse(c.seconds));
        summary.top_apps.sort_by_key(|a| (Reverse(a.seconds), a.app_id));
        summary.top_apps.truncate(TOP_APPS);
        Ok(summary)
    }

    /// Progress of every stored goal over the day containing `day`
    ///
    /// # Errors
    ///
    /// Returns `Store` if a query fails
    pub fn evaluate_goals(&self, day: DateTime<Utc>) -> Result<Vec<GoalProgress>> {
        let goals = self.db.get_goals()?;
        if goals.is_empty() {
            return Ok(Vec::new());
        }
        let (rollup, _) = self.period_rollup(Granularity::Day, day)?;
        let categories = self.db.get_categories()?;

        let scope_seconds = |scope: StatScope| {
            rollup
                .stats
                .iter()
                .find(|s| s.scope == scope)
                .map_or(0, |s| s.total_seconds)
        };

        let mut progress = Vec::with_capacity(goals.len());
        for goal in goals {
            let seconds = match (goal.kind, goal.scope.as_deref()) {
                (GoalKind::DailyMinutes, None) => rollup
                    .stats
                    .iter()
                    .filter(|s| matches!(s.scope, StatScope::Category(_)))
                    .map(|s| s.productive_seconds)
                    .sum(),
                (GoalKind::DailyMinutes, Some(name)) => categories
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
                    .map_or(0, |c| scope_seconds(StatScope::Category(c.id))),
                (GoalKind::AppLimit, Some(app)) => self
                    .db
                    .get_application(&canonical_name(app))?
                    .map_or(0, |a| scope_seconds(StatScope::App(a.id))),
                (GoalKind::AppLimit, None) => 0,
            };

            let actual_minutes = seconds / 60;
            let target = i64::from(goal.target_value);
            let met = match goal.kind {
                GoalKind::DailyMinutes => actual_minutes >= target,
                GoalKind::AppLimit => actual_minutes <= target,
            };
            progress.push(GoalProgress {
                goal,
                actual_minutes,
                met,
            });
        }
        Ok(progress)
    }

    /// Stored aggregates for a rolled period, otherwise a live rollup of raw
    /// sessions (open ones included, up to their last checkpoint)
    fn period_rollup(
        &self,
        granularity: Granularity,
        at: DateTime<Utc>,
    ) -> Result<(PeriodRollup, bool)> {
        let start = period_start(granularity, at, self.offset);
        let end = next_period_start(granularity, start, self.offset)
            .ok_or_else(|| EngineError::TaskFailed(format!("no period after {start}")))?;

        let rolled = self
            .db
            .get_watermark(&rolled_through_key(granularity))?
            .is_some_and(|through| end <= through);
        if rolled {
            let stats = self.db.get_period_stats(granularity, start, end, None)?;
            return Ok((
                PeriodRollup {
                    period_start: start,
                    period_end: end,
                    stats,
                },
                true,
            ));
        }

        let records = self.db.get_sessions(&SessionQuery::range(start, end))?;
        Ok((build_rollup(granularity, start, end, &records), false))
    }

    /// First period still to roll up, or `None` when there is no data
    fn resume_point(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>> {
        let rolled = self.db.get_watermark(&rolled_through_key(granularity))?;
        let compacted = match self.db.get_watermark(COMPACTED_THROUGH)? {
            Some(at) => ceil_to_period(granularity, at, self.offset),
            None => None,
        };

        let start = match rolled.max(compacted) {
            Some(at) => at,
            None => match self.db.earliest_session_start()? {
                Some(first) => period_start(granularity, first, self.offset),
                None => return Ok(None),
            },
        };
        Ok(Some(start))
    }
}

/// Per-app and per-category stats for `[start, end)`. Sessions crossing a
/// boundary contribute their overlap; their idle time is split in proportion.
fn build_rollup(
    granularity: Granularity,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    records: &[SessionRecord],
) -> PeriodRollup {
    let mut by_scope: BTreeMap<(&'static str, i64), PeriodStat> = BTreeMap::new();

    for record in records {
        let session = &record.session;
        let overlap = (session.end_time.min(end) - session.start_time.max(start)).num_seconds();
        let point_inside = session.start_time == session.end_time
            && session.start_time >= start
            && session.start_time < end;
        if overlap <= 0 && !point_inside {
            continue;
        }
        let overlap = overlap.max(0);

        let idle = idle_share(record, start, end);
        #[allow(clippy::cast_precision_loss)]
        let weighted = record.productivity_score * overlap as f64;

        for scope in [
            StatScope::App(session.app_id),
            StatScope::Category(record.category_id),
        ] {
            let stat = by_scope
                .entry((scope.kind(), scope.id()))
                .or_insert_with(|| PeriodStat {
                    granularity,
                    period_start: start,
                    period_end: end,
                    scope,
                    total_seconds: 0,
                    productive_seconds: 0,
                    distracting_seconds: 0,
                    idle_seconds: 0,
                    session_count: 0,
                    score_seconds: 0.0,
                });
            stat.total_seconds += overlap;
            if record.productivity_score > 0.0 {
                stat.productive_seconds += overlap;
            } else if record.productivity_score < 0.0 {
                stat.distracting_seconds += overlap;
            }
            stat.idle_seconds += idle;
            stat.session_count += 1;
            stat.score_seconds += weighted;
        }
    }

    PeriodRollup {
        period_start: start,
        period_end: end,
        stats: by_scope.into_values().collect(),
    }
}

/// Share of a session's idle time falling in `[start, end)`. Shares are
/// rounded cumulatively from the session start so they add up to the
/// session's idle time across periods.
fn idle_share(record: &SessionRecord, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let session = &record.session;
    let duration = session.duration_seconds();
    if duration == 0 {
        return 0;
    }
    let idle = i64::from(session.idle_time_seconds);
    let elapsed_at = |t: DateTime<Utc>| (t - session.start_time).num_seconds().clamp(0, duration);
    let rounded = |elapsed: i64| (idle * elapsed + duration / 2) / duration;
    rounded(elapsed_at(end)) - rounded(elapsed_at(start))
}
