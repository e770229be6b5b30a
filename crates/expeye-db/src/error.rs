//! Error types for the session layer.

use thiserror::Error;

/// Errors raised while opening, using, or tearing down a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The accessor was called outside any open scope.
    #[error("no active database session in this task")]
    NoActiveSession,

    /// A scope was opened while another scope was already active in the
    /// same task.
    #[error("a database session scope is already active in this task")]
    ScopeAlreadyActive,

    /// The active session is not of the requested type.
    #[error("active session is a {active}, not a {expected}")]
    TypeMismatch {
        /// The type the caller asked for.
        expected: &'static str,
        /// The type actually published by the scope.
        active: &'static str,
    },

    /// The handle was used after its scope closed it.
    #[error("database session has already been closed")]
    Closed,

    /// The session is already borrowed, either further up the current call
    /// stack or by another thread working on the same unit of work.
    #[error("database session is already in use")]
    Busy,

    /// No connection could be checked out of the pool.
    #[error("failed to check out a pooled connection: {0}")]
    Pool(#[from] r2d2::Error),

    /// A statement failed against the database.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A non-SQLite backend reported a failure.
    #[error("session backend error: {0}")]
    Backend(String),

    /// Rolling back or closing the session failed during teardown.
    #[error("session {action} failed during teardown: {source}")]
    Teardown {
        /// Either `"rollback"` or `"close"`.
        action: &'static str,
        /// The failure reported by the session.
        source: Box<SessionError>,
    },
}

impl SessionError {
    /// Returns `true` when the failure comes from pool exhaustion rather than
    /// from a statement or from misuse of the scope.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Pool(_) => true,
            Self::Teardown { source, .. } => source.is_unavailable(),
            _ => false,
        }
    }
}
