use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::helpers::{from_ts, parse_label, to_ts, to_u32};
use super::state::{put_state, rolled_through_key, COMPACTED_THROUGH};
use super::Database;
use crate::error::{Result, StoreError};
use crate::models::{Granularity, PeriodStat, StatScope};

/// All aggregate rows computed for one period
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodRollup {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub stats: Vec<PeriodStat>,
}

/// What a compaction pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Compaction {
    pub sessions_deleted: usize,
    pub idle_gaps_deleted: usize,
}

impl Database {
    /// Replace the aggregates of each given period and advance the rollup
    /// watermark, all in one transaction. Re-running with the same input
    /// leaves the table unchanged.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if a period starts before the compaction watermark
    /// (its raw data is gone); nothing is written in that case
    pub fn replace_periods(
        &self,
        granularity: Granularity,
        rollups: &[PeriodRollup],
        rolled_through: DateTime<Utc>,
    ) -> Result<usize> {
        self.ensure_writable()?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let compacted_through: Option<i64> = tx
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                [COMPACTED_THROUGH],
                |row| row.get(0),
            )
            .optional()?;

        let mut written = 0;
        {
            let mut delete = tx.prepare(
                "DELETE FROM period_stats WHERE granularity = ?1 AND period_start = ?2",
            )?;
            let mut insert = tx.prepare(
                "INSERT INTO period_stats
                 (granularity, period_start, period_end, scope_kind, scope_id, total_seconds,
                  productive_seconds, distracting_seconds, idle_seconds, session_count, score_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;

            for rollup in rollups {
                let start = to_ts(rollup.period_start);
                if compacted_through.is_some_and(|c| start < c) {
                    return Err(StoreError::Invalid(format!(
                        "{granularity} period {} is already compacted",
                        rollup.period_start
                    )));
                }

                delete.execute(params![granularity.as_str(), start])?;
                for stat in &rollup.stats {
                    insert.execute(params![
                        granularity.as_str(),
                        start,
                        to_ts(rollup.period_end),
                        stat.scope.kind(),
                        stat.scope.id(),
                        stat.total_seconds,
                        stat.productive_seconds,
                        stat.distracting_seconds,
                        stat.idle_seconds,
                        stat.session_count,
                        stat.score_seconds,
                    ])?;
                    written += 1;
                }
            }
        }

        put_state(&tx, &rolled_through_key(granularity), to_ts(rolled_through))?;
        tx.commit()?;

        log::debug!(
            "Rolled up {} {granularity} period(s) ({written} rows) through {rolled_through}",
            rollups.len()
        );
        Ok(written)
    }

    /// Aggregates of periods starting in `[start, end)`, optionally for a
    /// single scope
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_period_stats(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        scope: Option<StatScope>,
    ) -> Result<Vec<PeriodStat>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT granularity, period_start, period_end, scope_kind, scope_id, total_seconds,
                    productive_seconds, distracting_seconds, idle_seconds, session_count, score_seconds
             FROM period_stats
             WHERE granularity = ?1 AND period_start >= ?2 AND period_start < ?3
               AND (?4 IS NULL OR (scope_kind = ?4 AND scope_id = ?5))
             ORDER BY period_start, scope_kind, scope_id",
        )?;

        let stats = stmt
            .query_map(
                params![
                    granularity.as_str(),
                    to_ts(start),
                    to_ts(end),
                    scope.map(StatScope::kind),
                    scope.map(StatScope::id),
                ],
                |row| {
                    let kind: String = row.get(3)?;
                    let scope_id: i64 = row.get(4)?;
                    let scope = StatScope::from_parts(&kind, scope_id).ok_or_else(|| {
                        rusqlite::Error::InvalidColumnType(
                            3,
                            kind.clone(),
                            rusqlite::types::Type::Text,
                        )
                    })?;
                    Ok(PeriodStat {
                        granularity: parse_label(0, &row.get::<_, String>(0)?)?,
                        period_start: from_ts(1, row.get(1)?)?,
                        period_end: from_ts(2, row.get(2)?)?,
                        scope,
                        total_seconds: row.get(5)?,
                        productive_seconds: row.get(6)?,
                        distracting_seconds: row.get(7)?,
                        idle_seconds: row.get(8)?,
                        session_count: to_u32(row.get(9)?),
                        score_seconds: row.get(10)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    /// Delete closed sessions and idle gaps ending at or before `cutoff` and
    /// advance the compaction watermark, in one transaction. The watermark
    /// never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails; nothing is deleted
    pub fn compact_through(&self, cutoff: DateTime<Utc>) -> Result<Compaction> {
        self.ensure_writable()?;
        let cutoff_ts = to_ts(cutoff);
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sessions_deleted = tx.execute(
            "DELETE FROM sessions WHERE open = 0 AND end_time <= ?1",
            [cutoff_ts],
        )?;
        let idle_gaps_deleted =
            tx.execute("DELETE FROM idle_gaps WHERE end_time <= ?1", [cutoff_ts])?;
        tx.execute(
            "INSERT INTO engine_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![COMPACTED_THROUGH, cutoff_ts],
        )?;
        tx.commit()?;

        if sessions_deleted + idle_gaps_deleted > 0 {
            log::info!(
                "Compacted {sessions_deleted} session(s) and {idle_gaps_deleted} idle gap(s) through {cutoff}"
            );
        }
        Ok(Compaction {
            sessions_deleted,
            idle_gaps_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, NewApplication};
    use chrono::{Duration, TimeZone};

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, h, 0, 0).unwrap()
    }

    fn stat(start: DateTime<Utc>, scope: StatScope, total: i64) -> PeriodStat {
        PeriodStat {
            granularity: Granularity::Hour,
            period_start: start,
            period_end: start + Duration::hours(1),
            scope,
            total_seconds: total,
            productive_seconds: total,
            distracting_seconds: 0,
            idle_seconds: 0,
            session_count: 1,
            score_seconds: total as f64,
        }
    }

    fn rollup(start: DateTime<Utc>, stats: Vec<PeriodStat>) -> PeriodRollup {
        PeriodRollup {
            period_start: start,
            period_end: start + Duration::hours(1),
            stats,
        }
    }

    #[test]
    fn test_replace_periods_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let batch = vec![rollup(
            hour(9),
            vec![
                stat(hour(9), StatScope::App(1), 600),
                stat(hour(9), StatScope::Category(Category::DEVELOPMENT), 600),
            ],
        )];

        db.replace_periods(Granularity::Hour, &batch, hour(10)).unwrap();
        db.replace_periods(Granularity::Hour, &batch, hour(10)).unwrap();

        let stats = db
            .get_period_stats(Granularity::Hour, hour(0), hour(23), None)
            .unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(
            db.get_watermark(&rolled_through_key(Granularity::Hour)).unwrap(),
            Some(hour(10))
        );
    }

    #[test]
    fn test_scope_filter() {
        let db = Database::open_in_memory().unwrap();
        let batch = vec![
            rollup(hour(9), vec![stat(hour(9), StatScope::App(1), 60)]),
            rollup(
                hour(10),
                vec![
                    stat(hour(10), StatScope::App(1), 120),
                    stat(hour(10), StatScope::App(2), 30),
                ],
            ),
        ];
        db.replace_periods(Granularity::Hour, &batch, hour(11)).unwrap();

        let app1 = db
            .get_period_stats(Granularity::Hour, hour(0), hour(23), Some(StatScope::App(1)))
            .unwrap();
        assert_eq!(
            app1.iter().map(|s| s.total_seconds).collect::<Vec<_>>(),
            vec![60, 120]
        );
        assert!(db
            .get_period_stats(Granularity::Day, hour(0), hour(23), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_compaction_deletes_old_closed_rows_only() {
        let db = Database::open_in_memory().unwrap();
        let app = db
            .insert_application(&NewApplication {
                canonical_name: String::from("code"),
                display_name: String::from("Code"),
                category_id: Category::DEVELOPMENT,
                productivity_score: 1.0,
            })
            .unwrap();
        db.insert_closed_session(app.id, hour(1), hour(2), 0).unwrap();
        let recent = db.insert_closed_session(app.id, hour(5), hour(6), 0).unwrap();
        let open = db.insert_open_session(app.id, hour(0)).unwrap();
        db.insert_idle_gap(hour(2), hour(3)).unwrap();

        let result = db.compact_through(hour(4)).unwrap();
        assert_eq!(
            result,
            Compaction {
                sessions_deleted: 1,
                idle_gaps_deleted: 1
            }
        );
        assert!(db.get_session(recent).unwrap().is_some());
        assert!(db.get_session(open).unwrap().is_some());

        // Watermark only moves forward
        db.compact_through(hour(2)).unwrap();
        assert_eq!(db.get_watermark(COMPACTED_THROUGH).unwrap(), Some(hour(4)));
    }

    #[test]
    fn test_compacted_periods_are_not_rebuilt() {
        let db = Database::open_in_memory().unwrap();
        db.compact_through(hour(10)).unwrap();

        let stale = vec![rollup(hour(9), vec![stat(hour(9), StatScope::App(1), 60)])];
        assert!(matches!(
            db.replace_periods(Granularity::Hour, &stale, hour(10)),
            Err(StoreError::Invalid(_))
        ));
        assert!(db
            .get_period_stats(Granularity::Hour, hour(0), hour(23), None)
            .unwrap()
            .is_empty());
    }
}
