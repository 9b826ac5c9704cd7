use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::helpers::{from_ts, to_ts, to_u32};
use super::Database;
use crate::error::{Result, StoreError};
use crate::models::{IdleGap, Session, SessionRecord};

const SESSION_COLUMNS: &str = "s.id, s.app_id, s.start_time, s.end_time, s.idle_time_seconds, s.open";

/// Filter for report queries over raw sessions.
/// Sessions overlapping `[start, end)` are returned, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub app_id: Option<i64>,
    pub category_id: Option<i64>,
}

impl SessionQuery {
    #[must_use]
    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            app_id: None,
            category_id: None,
        }
    }

    #[must_use]
    pub fn for_app(mut self, app_id: i64) -> Self {
        self.app_id = Some(app_id);
        self
    }

    #[must_use]
    pub fn for_category(mut self, category_id: i64) -> Self {
        self.category_id = Some(category_id);
        self
    }
}

impl Database {
    /// Open a session at its first sample
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub fn insert_open_session(&self, app_id: i64, start_time: DateTime<Utc>) -> Result<i64> {
        self.ensure_writable()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (app_id, start_time, end_time, open, idle_time_seconds)
             VALUES (?1, ?2, ?2, 1, 0)",
            params![app_id, to_ts(start_time)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert an already closed session
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if the span is reversed or idle exceeds the span
    pub fn insert_closed_session(
        &self,
        app_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        idle_time_seconds: u32,
    ) -> Result<i64> {
        self.ensure_writable()?;
        Self::check_span(start_time, end_time, idle_time_seconds)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (app_id, start_time, end_time, open, idle_time_seconds)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![app_id, to_ts(start_time), to_ts(end_time), idle_time_seconds],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record the latest sample time of an open session, so a crash loses at
    /// most one sampling interval.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no open session has this id
    pub fn checkpoint_session(
        &self,
        session_id: i64,
        end_time: DateTime<Utc>,
        idle_time_seconds: u32,
    ) -> Result<()> {
        self.update_session_end(session_id, end_time, idle_time_seconds, true)
    }

    /// Close a session; it is immutable afterwards
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no open session has this id
    pub fn close_session(
        &self,
        session_id: i64,
        end_time: DateTime<Utc>,
        idle_time_seconds: u32,
    ) -> Result<()> {
        self.update_session_end(session_id, end_time, idle_time_seconds, false)
    }

    fn update_session_end(
        &self,
        session_id: i64,
        end_time: DateTime<Utc>,
        idle_time_seconds: u32,
        keep_open: bool,
    ) -> Result<()> {
        self.ensure_writable()?;
        let updated = self.conn().execute(
            "UPDATE sessions
             SET end_time = ?1, idle_time_seconds = MIN(?2, ?1 - start_time), open = ?3
             WHERE id = ?4 AND open = 1 AND ?1 >= start_time",
            params![
                to_ts(end_time),
                idle_time_seconds,
                i32::from(keep_open),
                session_id
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "open session {session_id} ending at {end_time}"
            )));
        }
        Ok(())
    }

    /// Drop a flicker session and extend the session it interrupted, in one
    /// transaction. The reopened session stays open at `end_time`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if either session is missing; nothing is changed
    pub fn merge_flicker(
        &self,
        reopen_id: i64,
        discard_id: i64,
        end_time: DateTime<Utc>,
        idle_time_seconds: u32,
    ) -> Result<()> {
        self.ensure_writable()?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let discarded = tx.execute("DELETE FROM sessions WHERE id = ?1", [discard_id])?;
        let reopened = tx.execute(
            "UPDATE sessions
             SET end_time = ?1, idle_time_seconds = MIN(?2, ?1 - start_time), open = 1
             WHERE id = ?3 AND ?1 >= end_time",
            params![to_ts(end_time), idle_time_seconds, reopen_id],
        )?;
        if discarded == 0 || reopened == 0 {
            return Err(StoreError::NotFound(format!(
                "flicker merge of session {discard_id} into {reopen_id}"
            )));
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete a session that should not be kept (flicker discard)
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub fn discard_session(&self, session_id: i64) -> Result<bool> {
        self.ensure_writable()?;
        let deleted = self
            .conn()
            .execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
        Ok(deleted > 0)
    }

    /// Get a session by id
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_session(&self, session_id: i64) -> Result<Option<Session>> {
        let result = self
            .conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.id = ?1"),
                [session_id],
                Self::row_to_session,
            )
            .optional()?;
        Ok(result)
    }

    /// Sessions not yet closed, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_open_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.open = 1 ORDER BY s.start_time"
        ))?;
        let sessions = stmt
            .query_map([], Self::row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Sessions overlapping the query range, joined with app and category
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS}, a.canonical_name, a.category_id, a.productivity_score
             FROM sessions s
             JOIN applications a ON a.id = s.app_id
             WHERE s.start_time < ?2 AND s.end_time >= ?1
               AND (?3 IS NULL OR s.app_id = ?3)
               AND (?4 IS NULL OR a.category_id = ?4)
             ORDER BY s.start_time, s.id"
        ))?;

        let records = stmt
            .query_map(
                params![
                    to_ts(query.start),
                    to_ts(query.end),
                    query.app_id,
                    query.category_id
                ],
                |row| {
                    Ok(SessionRecord {
                        session: Self::row_to_session(row)?,
                        app_name: row.get(6)?,
                        category_id: row.get(7)?,
                        productivity_score: row.get(8)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Start of the oldest raw session still stored
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn earliest_session_start(&self) -> Result<Option<DateTime<Utc>>> {
        let secs: Option<i64> =
            self.conn()
                .query_row("SELECT MIN(start_time) FROM sessions", [], |row| row.get(0))?;
        secs.map(|s| from_ts(0, s)).transpose().map_err(Into::into)
    }

    /// Start of the oldest session still open
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn earliest_open_session_start(&self) -> Result<Option<DateTime<Utc>>> {
        let secs: Option<i64> = self.conn().query_row(
            "SELECT MIN(start_time) FROM sessions WHERE open = 1",
            [],
            |row| row.get(0),
        )?;
        secs.map(|s| from_ts(0, s)).transpose().map_err(Into::into)
    }

    /// Record an idle gap
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for a reversed span
    pub fn insert_idle_gap(&self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Result<i64> {
        self.ensure_writable()?;
        Self::check_span(start_time, end_time, 0)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO idle_gaps (start_time, end_time) VALUES (?1, ?2)",
            params![to_ts(start_time), to_ts(end_time)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Idle gaps overlapping `[start, end)`, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_idle_gaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<IdleGap>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, start_time, end_time FROM idle_gaps
             WHERE start_time < ?2 AND end_time >= ?1
             ORDER BY start_time",
        )?;
        let gaps = stmt
            .query_map(params![to_ts(start), to_ts(end)], |row| {
                Ok(IdleGap {
                    id: row.get(0)?,
                    start_time: from_ts(1, row.get(1)?)?,
                    end_time: from_ts(2, row.get(2)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(gaps)
    }

    fn check_span(start: DateTime<Utc>, end: DateTime<Utc>, idle_seconds: u32) -> Result<()> {
        let span = (end - start).num_seconds();
        if span < 0 || i64::from(idle_seconds) > span {
            return Err(StoreError::Invalid(format!(
                "span {start}..{end} with {idle_seconds}s idle"
            )));
        }
        Ok(())
    }

    pub(crate) fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get(0)?,
            app_id: row.get(1)?,
            start_time: from_ts(2, row.get(2)?)?,
            end_time: from_ts(3, row.get(3)?)?,
            idle_time_seconds: to_u32(row.get(4)?),
            open: row.get::<_, i64>(5)? != 0,
        })
    }
}
