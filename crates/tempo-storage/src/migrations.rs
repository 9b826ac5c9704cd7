use rusqlite::{params, Connection, TransactionBehavior};

use crate::error::{Result, StoreError};
use crate::models::Category;

/// Schema version this build reads and writes
pub const SCHEMA_VERSION: i64 = 3;

/// Forward-only migrations; entry `i` upgrades version `i` to `i + 1`
const MIGRATIONS: [&str; 3] = [
    // v1: base tables
    "CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        default_productivity_score REAL NOT NULL,
        builtin INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS applications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        canonical_name TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        category_id INTEGER NOT NULL REFERENCES categories(id),
        productivity_score REAL NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_id INTEGER NOT NULL REFERENCES applications(id),
        start_time INTEGER NOT NULL,
        end_time INTEGER NOT NULL,
        open INTEGER NOT NULL DEFAULT 0,
        CHECK (end_time >= start_time)
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_time ON sessions (start_time, end_time);
    CREATE INDEX IF NOT EXISTS idx_sessions_app ON sessions (app_id);

    CREATE TABLE IF NOT EXISTS rules (
        id TEXT PRIMARY KEY,
        pattern TEXT NOT NULL,
        match_kind TEXT NOT NULL,
        category_id INTEGER NOT NULL REFERENCES categories(id),
        priority INTEGER NOT NULL,
        position INTEGER NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS goals (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        target_value INTEGER NOT NULL,
        scope TEXT
    );

    CREATE TABLE IF NOT EXISTS period_stats (
        granularity TEXT NOT NULL,
        period_start INTEGER NOT NULL,
        period_end INTEGER NOT NULL,
        scope_kind TEXT NOT NULL,
        scope_id INTEGER NOT NULL,
        total_seconds INTEGER NOT NULL,
        productive_seconds INTEGER NOT NULL,
        distracting_seconds INTEGER NOT NULL,
        idle_seconds INTEGER NOT NULL,
        session_count INTEGER NOT NULL,
        score_seconds REAL NOT NULL,
        PRIMARY KEY (granularity, period_start, scope_kind, scope_id)
    );

    CREATE TABLE IF NOT EXISTS engine_state (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );",
    // v2: sub-threshold idle per session, idle gaps
    "ALTER TABLE sessions ADD COLUMN idle_time_seconds INTEGER NOT NULL DEFAULT 0;

    CREATE TABLE IF NOT EXISTS idle_gaps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        start_time INTEGER NOT NULL,
        end_time INTEGER NOT NULL,
        CHECK (end_time >= start_time)
    );
    CREATE INDEX IF NOT EXISTS idx_idle_gaps_time ON idle_gaps (start_time, end_time);",
    // v3: user pinned app categories
    "ALTER TABLE applications ADD COLUMN user_override INTEGER NOT NULL DEFAULT 0;",
];

/// Read the schema version stored in the file header
///
/// # Errors
///
/// Returns an error if the pragma cannot be read
pub fn schema_version(conn: &Connection) -> Result<i64> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the schema up to [`SCHEMA_VERSION`], one transaction per step.
///
/// # Errors
///
/// Returns `SchemaMismatch` if the file comes from a newer engine, or an I/O
/// error if a migration fails (the failed step is rolled back).
pub fn init_schema(conn: &mut Connection) -> Result<()> {
    let found = schema_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    let start = usize::try_from(found)
        .map_err(|_| StoreError::Invalid(format!("negative schema version {found}")))?;

    for (sql, version) in MIGRATIONS.iter().zip(1_i64..).skip(start) {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        log::info!("Migrated store schema to v{version}");
    }

    Ok(())
}

/// Seed built-in categories. Existing ids are left untouched.
///
/// # Errors
///
/// Returns an error if an insert fails
pub fn insert_default_categories(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO categories (id, name, default_productivity_score, builtin)
         VALUES (?1, ?2, ?3, 1)",
    )?;

    let mut inserted = 0;
    for category in Category::builtins() {
        inserted += stmt.execute(params![
            category.id,
            category.name,
            category.default_productivity_score
        ])?;
    }

    if inserted > 0 {
        log::info!("Inserted {inserted} default categories");
    }
    Ok(())
}
