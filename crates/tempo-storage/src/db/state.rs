//! Engine key/value state (aggregation watermarks).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::helpers::{from_ts, to_ts};
use super::Database;
use crate::error::Result;
use crate::models::Granularity;

/// Raw data strictly before this instant has been deleted
pub const COMPACTED_THROUGH: &str = "compacted_through";

/// Key of the rollup watermark for one granularity
#[must_use]
pub fn rolled_through_key(granularity: Granularity) -> String {
    format!("rolled_through:{granularity}")
}

impl Database {
    /// Read a state value
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_state(&self, key: &str) -> Result<Option<i64>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM engine_state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write a state value
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub fn set_state(&self, key: &str, value: i64) -> Result<()> {
        self.ensure_writable()?;
        put_state(&self.conn(), key, value)
    }

    /// Read a timestamp watermark
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the value is out of range
    pub fn get_watermark(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.get_state(key)?
            .map(|secs| from_ts(0, secs))
            .transpose()
            .map_err(Into::into)
    }

    /// Write a timestamp watermark
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub fn set_watermark(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.set_state(key, to_ts(at))
    }
}

/// Upsert inside whatever transaction `conn` currently runs
pub(super) fn put_state(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO engine_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
