//! Database helper functions for safe type conversions.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;

/// Timestamps are stored as whole unix seconds
pub fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// Parse a unix-seconds column, returning a rusqlite error on overflow.
pub fn from_ts(idx: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(idx, secs)
    })
}

/// Parse a UUID string from database, returning a rusqlite error on failure.
pub fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse a stored enum label via its `FromStr` impl.
pub fn parse_label<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

/// Saturating conversion for second counts read back from SQLite.
pub fn to_u32(secs: i64) -> u32 {
    u32::try_from(secs.max(0)).unwrap_or(u32::MAX)
}
