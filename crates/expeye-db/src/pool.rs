//! Connection pool creation and configuration.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use thiserror::Error;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Number of connections the pool keeps open while idle.
    pub pool_size: u32,

    /// Additional connections the pool may open under load, on top of
    /// `pool_size`.
    pub max_overflow: u32,

    /// How long a checkout waits for a free connection, in milliseconds.
    pub connection_timeout_ms: u64,
}

impl DbRuntimeSettings {
    /// Upper bound on simultaneously open connections.
    pub fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_size: 3,
            max_overflow: 6,
            connection_timeout_ms: 30_000,
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors that can occur when creating the database pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),

    /// The configured sizes leave no room for a single connection.
    #[error("database pool must allow at least one connection (pool={pool_size}, overflow={max_overflow})")]
    EmptyPool {
        /// Configured base size.
        pool_size: u32,
        /// Configured overflow allowance.
        max_overflow: u32,
    },
}

/// Creates a new SQLite connection pool with WAL mode and foreign keys enabled.
///
/// The pool keeps `pool_size` connections warm and grows to
/// `pool_size + max_overflow` under load.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. Use `:memory:` for an
///   in-memory database (useful for testing; every connection then gets its
///   own private database).
///
/// # Errors
///
/// Returns `PoolError::EmptyPool` if both sizes are zero and
/// `PoolError::PoolInit` if the connection pool cannot be created.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let max_size = settings.max_connections();
    if max_size == 0 {
        return Err(PoolError::EmptyPool {
            pool_size: settings.pool_size,
            max_overflow: settings.max_overflow,
        });
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            // In-memory databases report "memory" which is expected and acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                settings.busy_timeout_ms
            ))
        });

    let pool = Pool::builder()
        .max_size(max_size)
        .min_idle(Some(settings.pool_size))
        .connection_timeout(Duration::from_millis(settings.connection_timeout_ms))
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        pool_size = settings.pool_size,
        max_overflow = settings.max_overflow,
        "created database connection pool"
    );

    Ok(pool)
}
