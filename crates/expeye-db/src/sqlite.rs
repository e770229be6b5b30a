//! SQLite-backed sessions drawn from the connection pool.

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::SessionError;
use crate::pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
use crate::session::Session;

/// One pooled connection used as a unit-of-work session.
///
/// Transactions are explicit: call [`DbSession::begin`] before writing and
/// [`Session::commit`] to keep the changes. Anything still open when the
/// scope exits is rolled back.
pub struct DbSession {
    conn: PooledConnection<SqliteConnectionManager>,
}

impl DbSession {
    /// Borrows the underlying connection for queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Starts a deferred transaction unless one is already open.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Database` if SQLite rejects the `BEGIN`.
    pub fn begin(&mut self) -> Result<(), SessionError> {
        if self.in_transaction() {
            return Ok(());
        }
        self.conn.execute_batch("BEGIN DEFERRED")?;
        Ok(())
    }

    /// Returns `true` while a transaction is open on this connection.
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}

impl Session for DbSession {
    fn commit(&mut self) -> Result<(), SessionError> {
        if self.in_transaction() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SessionError> {
        if self.in_transaction() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SessionError> {
        // The connection goes back to the pool when the session is dropped;
        // it must not carry an open transaction with it.
        if self.in_transaction() {
            tracing::debug!("closing session with an open transaction, rolling back");
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

/// Produces a new [`DbSession`] per scope from a shared pool.
///
/// Cloning is cheap and every clone draws from the same pool, so one factory
/// can be handed to all request handlers.
#[derive(Clone)]
pub struct SessionFactory {
    pool: DbPool,
}

impl SessionFactory {
    /// Wraps an existing pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Builds the pool from settings and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the pool cannot be created.
    pub fn from_settings(db_path: &str, settings: DbRuntimeSettings) -> Result<Self, PoolError> {
        Ok(Self::new(create_pool(db_path, settings)?))
    }

    /// Checks a connection out of the pool as a new session.
    ///
    /// Blocks for up to the pool's connection timeout when every connection
    /// is in use.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Pool` if no connection becomes available.
    pub fn create(&self) -> Result<DbSession, SessionError> {
        let conn = self.pool.get()?;
        Ok(DbSession { conn })
    }

    /// The pool sessions are drawn from.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}
