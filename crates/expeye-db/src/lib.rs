//! Database layer for the expeye services.
//!
//! Provides SQLite connection pooling (via `r2d2`), a `Session` capability
//! over a single pooled connection, and the per-task session scope that
//! request middleware opens around every unit of work.
//!
//! # Design decisions
//!
//! - **Task-local current session**: a server handles many requests at once,
//!   so the "current session" lives in a `tokio::task_local!` slot rather than
//!   a global. Each task sees only the session its own scope published.
//! - **Guaranteed release**: [`open_scope`] and [`open_scope_blocking`] close
//!   the session on every exit path. Failure, panic and cancellation roll the
//!   session back first.
//! - **Explicit commit**: scopes never commit. Handlers that write call
//!   [`DbSession::commit`] themselves.
//!
//! # Usage
//!
//! ```rust,ignore
//! use expeye_db::{current_session, open_scope, DbSession, SessionError, SessionFactory};
//!
//! let factory = SessionFactory::new(pool);
//! let rows = open_scope(
//!     || async move { factory.create() },
//!     async {
//!         let session = current_session::<DbSession>()?;
//!         session.with(|s| count_rows(s.connection()))?
//!     },
//! )
//! .await?;
//! ```

mod error;
mod pool;
mod session;
mod sqlite;

pub use error::SessionError;
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
pub use session::{
    current_session, has_active_session, open_scope, open_scope_blocking, Session, SessionHandle,
};
pub use sqlite::{DbSession, SessionFactory};
