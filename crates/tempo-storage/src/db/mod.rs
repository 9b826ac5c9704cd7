//! Database operations split into domain-specific modules.
//!
//! `Database` wraps one SQLite connection. A writer handle serializes every
//! mutation behind its mutex; report readers open their own read-only
//! handles so they never wait on the writer for longer than the lock timeout.
//! At most one writer handle per store file exists at a time, across
//! processes.

mod applications;
mod categories;
mod goals;
mod helpers;
mod period_stats;
mod sessions;
mod state;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::{Result, StoreError};
use crate::migrations;

pub use period_stats::{Compaction, PeriodRollup};
pub use sessions::SessionQuery;
pub use state::{rolled_through_key, COMPACTED_THROUGH};

/// Default bounded wait for a locked database
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    read_only: bool,
    // Declared last: released only after the store connection has closed
    _writer_lock: Option<WriterLock>,
}

/// Exclusive claim on a store file for writing.
///
/// Held as an exclusive-mode SQLite connection on `<store>.lock`. The OS
/// drops the file lock when the handle closes or the process dies, so a
/// crashed daemon never leaves a stale claim behind.
struct WriterLock {
    _conn: Mutex<Connection>,
}

impl WriterLock {
    fn acquire(store: &Path) -> Result<Self> {
        let mut lock_path = store.as_os_str().to_owned();
        lock_path.push(".lock");

        let conn = Connection::open(PathBuf::from(lock_path))?;
        match Self::claim(&conn) {
            Ok(()) => Ok(Self { _conn: Mutex::new(conn) }),
            Err(StoreError::Busy) => Err(StoreError::Locked(store.to_path_buf())),
            Err(e) => Err(e),
        }
    }

    /// The first write in exclusive locking mode takes a lock that is kept
    /// until the connection closes. No busy timeout: a held lock fails at once.
    fn claim(conn: &Connection) -> Result<()> {
        let _mode: String =
            conn.pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| row.get(0))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS writer (pid INTEGER NOT NULL);
             DELETE FROM writer;",
        )?;
        conn.execute("INSERT INTO writer (pid) VALUES (?1)", [std::process::id()])?;
        Ok(())
    }
}

impl Database {
    /// Open (or create) the writable store at `db_path`, defaulting to the
    /// per-user data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation, connection opening or schema
    /// migration fails, or `SchemaMismatch` for files from a newer engine.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        Self::open_with_timeout(db_path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open the writable store with an explicit lock wait
    ///
    /// # Errors
    ///
    /// Returns `Locked` while another handle (in this or any other process)
    /// has the store open for writing; otherwise see [`Database::new`].
    pub fn open_with_timeout(db_path: Option<PathBuf>, lock_timeout: Duration) -> Result<Self> {
        let path = db_path.unwrap_or_else(Self::default_db_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer_lock = WriterLock::acquire(&path)?;

        let mut conn = Connection::open(&path)?;
        conn.busy_timeout(lock_timeout)?;
        // Readers keep reading while the writer commits
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;

        migrations::init_schema(&mut conn)?;
        migrations::insert_default_categories(&conn)?;

        log::info!(
            "Store opened at {} (journal: {journal}, schema v{})",
            path.display(),
            migrations::SCHEMA_VERSION
        );

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
            read_only: false,
            _writer_lock: Some(writer_lock),
        })
    }

    /// Open a read-only handle for report queries.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, or `SchemaMismatch`
    /// when it was written by a newer engine.
    pub fn open_reader(path: &Path, lock_timeout: Duration) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(lock_timeout)?;

        let found = migrations::schema_version(&conn)?;
        if found > migrations::SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                found,
                supported: migrations::SCHEMA_VERSION,
            });
        }

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            read_only: true,
            _writer_lock: None,
        })
    }

    /// Private in-memory store, used by tests and dry runs
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations::init_schema(&mut conn)?;
        migrations::insert_default_categories(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            read_only: false,
            _writer_lock: None,
        })
    }

    /// Get default database path
    #[must_use]
    pub fn default_db_path() -> PathBuf {
        let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("tempo");
        path.push("tempo.db");
        path
    }

    /// File backing this store, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Exclusive access to the connection. A panic while holding the lock
    /// leaves no partial state behind (every mutation is transactional), so a
    /// poisoned lock is recovered.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::Invalid(String::from(
                "write attempted on a read-only store handle",
            )));
        }
        Ok(())
    }

    /// Write a consistent point-in-time copy of the store to `target`.
    ///
    /// Writes are quiesced for the duration of the copy because the writer
    /// lock is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the target exists or the copy fails
    pub fn backup_to(&self, target: &Path) -> Result<()> {
        if target.exists() {
            return Err(StoreError::Invalid(format!(
                "backup target {} already exists",
                target.display()
            )));
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = self.conn();
        conn.execute("VACUUM INTO ?1", [target.to_string_lossy().into_owned()])?;
        log::info!("Store backed up to {}", target.display());
        Ok(())
    }

    /// Close every session left open by a previous run at its last
    /// checkpointed sample time. Returns how many were closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails
    pub fn recover_open_sessions(&self) -> Result<usize> {
        self.ensure_writable()?;
        let recovered = self
            .conn()
            .execute("UPDATE sessions SET open = 0 WHERE open = 1", [])?;
        if recovered > 0 {
            log::warn!("Recovered {recovered} session(s) left open by an unclean shutdown");
        }
        Ok(recovered)
    }
}
