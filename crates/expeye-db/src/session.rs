//! Per-task database session scope.
//!
//! A scope publishes exactly one session into a `tokio::task_local!` slot for
//! the duration of a unit of work (normally one HTTP request). Code running
//! inside the scope retrieves it with [`current_session`]; code running
//! outside gets [`SessionError::NoActiveSession`].
//!
//! Teardown is owned by a guard created right after the factory returns:
//!
//! | Exit path | Teardown |
//! |-----------|----------|
//! | body returns `Ok` | `close` |
//! | body returns `Err` | `rollback`, then `close` |
//! | body panics | `rollback`, then `close` |
//! | scope future dropped | `rollback`, then `close` |
//!
//! Nested scopes in the same task are rejected with
//! [`SessionError::ScopeAlreadyActive`] before the factory runs.
//!
//! Access through a [`SessionHandle`] never blocks: using the session while
//! it is already borrowed returns [`SessionError::Busy`]. If the session is
//! still borrowed by a blocking task when a cancelled or failed scope tears
//! down, the rollback moves to a blocking thread instead of stalling the
//! async worker.

use std::any::{type_name, Any};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crate::error::SessionError;

/// A unit-of-work context against a persistence backend.
///
/// Implementations must tolerate `rollback` with nothing to roll back, and
/// `close` is called exactly once by the scope that owns the session.
pub trait Session: Send + 'static {
    /// Makes pending changes durable.
    fn commit(&mut self) -> Result<(), SessionError>;

    /// Discards pending changes.
    fn rollback(&mut self) -> Result<(), SessionError>;

    /// Releases the underlying connection.
    fn close(&mut self) -> Result<(), SessionError>;
}

/// Shared reference to the session published by a scope.
///
/// Clones refer to the same session; use [`SessionHandle::ptr_eq`] to compare
/// identity. Once the owning scope exits the session is closed and every
/// clone reports [`SessionError::Closed`].
pub struct SessionHandle<S> {
    slot: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for SessionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<S> fmt::Debug for SessionHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &type_name::<S>())
            .finish_non_exhaustive()
    }
}

impl<S: Session> SessionHandle<S> {
    fn new(session: S) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(session))),
        }
    }

    /// Runs `f` with exclusive access to the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the owning scope has already exited,
    /// and [`SessionError::Busy`] if the session is borrowed elsewhere, for
    /// instance by an enclosing `with` on this thread.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, SessionError> {
        let mut slot = self.try_lock()?;
        match slot.as_mut() {
            Some(session) => Ok(f(session)),
            None => Err(SessionError::Closed),
        }
    }

    /// Commits the session. Scopes never do this on their own.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after the scope exits,
    /// [`SessionError::Busy`] while the session is borrowed, or whatever the
    /// backend reports.
    pub fn commit(&self) -> Result<(), SessionError> {
        self.with(|session| session.commit())?
    }

    /// Rolls the session back without closing it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after the scope exits,
    /// [`SessionError::Busy`] while the session is borrowed, or whatever the
    /// backend reports.
    pub fn rollback(&self) -> Result<(), SessionError> {
        self.with(|session| session.rollback())?
    }

    /// Returns `true` once the owning scope has closed the session.
    pub fn is_closed(&self) -> bool {
        match self.try_lock() {
            Ok(slot) => slot.is_none(),
            Err(_) => false,
        }
    }

    /// Returns `true` if both handles refer to the same session.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.slot, &b.slot)
    }

    /// Closes the session and drops it, returning the connection to its pool.
    fn close(&self) -> Result<(), SessionError> {
        let taken = self.lock().take();
        match taken {
            Some(mut session) => session.close(),
            None => Ok(()),
        }
    }

    fn try_lock(&self) -> Result<MutexGuard<'_, Option<S>>, SessionError> {
        match self.slot.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(SessionError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(recover(poisoned.into_inner())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<S>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => recover(poisoned.into_inner()),
        }
    }
}

// A panic while the session was borrowed. Teardown must still reach the
// session, so keep going with the inner value.
fn recover<T>(guard: T) -> T {
    tracing::error!("session lock poisoned, recovering");
    guard
}

/// The value stored in the task-local slot.
struct ActiveSession {
    handle: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ActiveSession {
    fn new<S: Session>(handle: SessionHandle<S>) -> Self {
        Self {
            handle: Box::new(handle),
            type_name: type_name::<S>(),
        }
    }

    fn downcast<S: Session>(&self) -> Result<SessionHandle<S>, SessionError> {
        self.handle
            .downcast_ref::<SessionHandle<S>>()
            .cloned()
            .ok_or(SessionError::TypeMismatch {
                expected: type_name::<S>(),
                active: self.type_name,
            })
    }
}

tokio::task_local! {
    static CURRENT_SESSION: ActiveSession;
}

/// Returns the session published by the innermost open scope of this task.
///
/// # Errors
///
/// Returns [`SessionError::NoActiveSession`] outside any scope, and
/// [`SessionError::TypeMismatch`] if the scope holds a different session type.
pub fn current_session<S: Session>() -> Result<SessionHandle<S>, SessionError> {
    CURRENT_SESSION
        .try_with(|active| active.downcast::<S>())
        .map_err(|_| SessionError::NoActiveSession)?
}

/// Returns `true` if a scope is open in the current task or thread.
pub fn has_active_session() -> bool {
    CURRENT_SESSION.try_with(|_| ()).is_ok()
}

/// Runs `body` with a fresh session published as the task's current session.
///
/// `factory` is awaited exactly once. If it fails, nothing is published and
/// its error is returned as is. Otherwise the session is closed when `body`
/// succeeds, and rolled back then closed when `body` fails, panics, or this
/// future is dropped before completion. Body errors are returned unchanged;
/// teardown failures on that path are logged, never substituted.
///
/// # Errors
///
/// Returns the factory's or the body's error, [`SessionError::ScopeAlreadyActive`]
/// when called inside another scope, or [`SessionError::Teardown`] if closing
/// fails after a successful body.
pub async fn open_scope<S, F, Fut, B, T, E>(factory: F, body: B) -> Result<T, E>
where
    S: Session,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<S, E>>,
    B: Future<Output = Result<T, E>>,
    E: From<SessionError>,
{
    if has_active_session() {
        return Err(SessionError::ScopeAlreadyActive.into());
    }

    let handle = SessionHandle::new(factory().await?);
    let guard = ScopeGuard::new(handle.clone());

    let outcome = CURRENT_SESSION
        .scope(ActiveSession::new(handle), body)
        .await;

    guard.finish(outcome)
}

/// Blocking counterpart of [`open_scope`] for code running on its own thread.
///
/// The session is visible to [`current_session`] on the calling thread only.
///
/// # Errors
///
/// Same as [`open_scope`].
pub fn open_scope_blocking<S, F, B, T, E>(factory: F, body: B) -> Result<T, E>
where
    S: Session,
    F: FnOnce() -> Result<S, E>,
    B: FnOnce() -> Result<T, E>,
    E: From<SessionError>,
{
    if has_active_session() {
        return Err(SessionError::ScopeAlreadyActive.into());
    }

    let handle = SessionHandle::new(factory()?);
    let guard = ScopeGuard::new(handle.clone());

    let outcome = CURRENT_SESSION.sync_scope(ActiveSession::new(handle), body);

    guard.finish(outcome)
}

/// Tears the session down on every exit path.
///
/// While armed, dropping the guard rolls back and closes. `finish` disarms it
/// and picks the teardown matching the body's outcome.
struct ScopeGuard<S: Session> {
    handle: SessionHandle<S>,
    armed: bool,
}

impl<S: Session> ScopeGuard<S> {
    fn new(handle: SessionHandle<S>) -> Self {
        Self {
            handle,
            armed: true,
        }
    }

    fn finish<T, E>(mut self, outcome: Result<T, E>) -> Result<T, E>
    where
        E: From<SessionError>,
    {
        self.armed = false;
        match outcome {
            Ok(value) => {
                self.handle.close().map_err(|e| {
                    tracing::error!(error = %e, "session close failed");
                    SessionError::Teardown {
                        action: "close",
                        source: Box::new(e),
                    }
                })?;
                Ok(value)
            }
            Err(err) => {
                abort_scope(&self.handle, "error");
                Err(err)
            }
        }
    }
}

impl<S: Session> Drop for ScopeGuard<S> {
    fn drop(&mut self) {
        if self.armed {
            let reason = if std::thread::panicking() {
                "panic"
            } else {
                "cancelled"
            };
            tracing::warn!(reason, "session scope exited abnormally, rolling back");
            abort_scope(&self.handle, reason);
        }
    }
}

/// Rolls back and closes without blocking the calling thread on a session
/// that is still borrowed. Inside a tokio runtime a busy session is handed
/// to a blocking thread that waits for the borrower to finish.
fn abort_scope<S: Session>(handle: &SessionHandle<S>, reason: &'static str) {
    let taken = match handle.try_lock() {
        Ok(mut slot) => slot.take(),
        Err(_) => match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(reason, "session still borrowed, deferring teardown");
                let handle = handle.clone();
                runtime.spawn_blocking(move || {
                    let taken = handle.lock().take();
                    rollback_and_close(taken, reason);
                });
                return;
            }
            Err(_) => handle.lock().take(),
        },
    };
    rollback_and_close(taken, reason);
}

fn rollback_and_close<S: Session>(session: Option<S>, reason: &'static str) {
    let Some(mut session) = session else {
        return;
    };
    if let Err(e) = session.rollback() {
        tracing::error!(reason, error = %e, "session rollback failed during teardown");
    }
    if let Err(e) = session.close() {
        tracing::error!(reason, error = %e, "session close failed during teardown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type CallLog = Arc<Mutex<Vec<String>>>;

    struct FakeSession {
        id: usize,
        log: CallLog,
        fail_rollback: bool,
        fail_close: bool,
    }

    impl FakeSession {
        fn new(id: usize, log: &CallLog) -> Self {
            Self {
                id,
                log: Arc::clone(log),
                fail_rollback: false,
                fail_close: false,
            }
        }

        fn record(&self, call: &str) {
            self.log.lock().unwrap().push(format!("{call}:{}", self.id));
        }
    }

    impl Session for FakeSession {
        fn commit(&mut self) -> Result<(), SessionError> {
            self.record("commit");
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), SessionError> {
            self.record("rollback");
            if self.fail_rollback {
                return Err(SessionError::Backend("rollback refused".to_string()));
            }
            Ok(())
        }

        fn close(&mut self) -> Result<(), SessionError> {
            self.record("close");
            if self.fail_close {
                return Err(SessionError::Backend("close refused".to_string()));
            }
            Ok(())
        }
    }

    struct OtherSession;

    impl Session for OtherSession {
        fn commit(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("boom: {0}")]
        Boom(String),
        #[error(transparent)]
        Session(#[from] SessionError),
    }

    fn explode(msg: &str) -> Result<(), TestError> {
        panic!("{msg}")
    }

    fn new_log() -> CallLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn calls(log: &CallLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn no_session_outside_scope() {
        let err = current_session::<FakeSession>().expect_err("no scope is open");
        assert!(matches!(err, SessionError::NoActiveSession));
        assert!(!has_active_session());
    }

    #[tokio::test]
    async fn no_session_outside_scope_in_task() {
        let err = current_session::<FakeSession>().expect_err("no scope is open");
        assert!(matches!(err, SessionError::NoActiveSession));
    }

    #[tokio::test]
    async fn session_visible_and_closed_on_success() {
        let log = new_log();
        let created: Arc<Mutex<Option<SessionHandle<FakeSession>>>> = Arc::default();
        let factory_calls = Arc::new(AtomicUsize::new(0));

        let result: Result<usize, TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                let factory_calls = Arc::clone(&factory_calls);
                move || async move {
                    factory_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(FakeSession::new(7, &log))
                }
            },
            {
                let created = Arc::clone(&created);
                async move {
                    let first = current_session::<FakeSession>()?;
                    let second = current_session::<FakeSession>()?;
                    assert!(SessionHandle::ptr_eq(&first, &second));
                    *created.lock().unwrap() = Some(first.clone());
                    Ok(first.with(|s| s.id)?)
                }
            },
        )
        .await;

        assert_eq!(result.expect("scope should succeed"), 7);
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert_eq!(calls(&log), vec!["close:7"]);

        let escaped = created.lock().unwrap().take().expect("handle captured");
        assert!(escaped.is_closed());
        assert!(matches!(escaped.with(|s| s.id), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn body_error_rolls_back_then_closes() {
        let log = new_log();

        let result: Result<(), TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                move || async move { Ok(FakeSession::new(1, &log)) }
            },
            async {
                current_session::<FakeSession>()?;
                Err(TestError::Boom("boom".to_string()))
            },
        )
        .await;

        match result {
            Err(TestError::Boom(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls(&log), vec!["rollback:1", "close:1"]);
    }

    #[tokio::test]
    async fn session_absent_after_scope_exits() {
        let log = new_log();

        let _: Result<(), TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                move || async move { Ok(FakeSession::new(1, &log)) }
            },
            async { Ok(()) },
        )
        .await;
        assert!(matches!(
            current_session::<FakeSession>(),
            Err(SessionError::NoActiveSession)
        ));

        let _: Result<(), TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                move || async move { Ok(FakeSession::new(2, &log)) }
            },
            async { Err(TestError::Boom("later".to_string())) },
        )
        .await;
        assert!(matches!(
            current_session::<FakeSession>(),
            Err(SessionError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn factory_failure_skips_teardown() {
        let result: Result<(), TestError> = open_scope(
            || async { Err::<FakeSession, _>(TestError::Boom("no connection".to_string())) },
            async { explode("body must not run when the factory fails") },
        )
        .await;

        assert!(matches!(result, Err(TestError::Boom(ref m)) if m == "no connection"));
        assert!(!has_active_session());
    }

    #[tokio::test]
    async fn nested_scope_is_rejected() {
        let log = new_log();
        let inner_factory_calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                move || async move { Ok(FakeSession::new(1, &log)) }
            },
            {
                let log = Arc::clone(&log);
                let inner_factory_calls = Arc::clone(&inner_factory_calls);
                async move {
                    let outer = current_session::<FakeSession>()?;
                    let nested: Result<(), TestError> = open_scope(
                        move || async move {
                            inner_factory_calls.fetch_add(1, Ordering::SeqCst);
                            Ok(FakeSession::new(2, &log))
                        },
                        async { Ok(()) },
                    )
                    .await;
                    assert!(matches!(
                        nested,
                        Err(TestError::Session(SessionError::ScopeAlreadyActive))
                    ));

                    let still = current_session::<FakeSession>()?;
                    assert!(SessionHandle::ptr_eq(&outer, &still));
                    Ok(())
                }
            },
        )
        .await;

        result.expect("outer scope should succeed");
        assert_eq!(inner_factory_calls.load(Ordering::SeqCst), 0);
        assert_eq!(calls(&log), vec!["close:1"]);
    }

    #[tokio::test]
    async fn rollback_failure_does_not_mask_body_error() {
        let log = new_log();

        let result: Result<(), TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                move || async move {
                    let mut session = FakeSession::new(3, &log);
                    session.fail_rollback = true;
                    Ok(session)
                }
            },
            async { Err(TestError::Boom("original".to_string())) },
        )
        .await;

        assert!(matches!(result, Err(TestError::Boom(ref m)) if m == "original"));
        assert_eq!(calls(&log), vec!["rollback:3", "close:3"]);
    }

    #[tokio::test]
    async fn close_failure_after_success_is_reported() {
        let log = new_log();

        let result: Result<(), TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                move || async move {
                    let mut session = FakeSession::new(4, &log);
                    session.fail_close = true;
                    Ok(session)
                }
            },
            async { Ok(()) },
        )
        .await;

        match result {
            Err(TestError::Session(SessionError::Teardown { action, .. })) => {
                assert_eq!(action, "close")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls(&log), vec!["close:4"]);
    }

    #[tokio::test]
    async fn close_failure_does_not_mask_body_error() {
        let log = new_log();

        let result: Result<(), TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                move || async move {
                    let mut session = FakeSession::new(6, &log);
                    session.fail_close = true;
                    Ok(session)
                }
            },
            async { Err(TestError::Boom("original".to_string())) },
        )
        .await;

        assert!(matches!(result, Err(TestError::Boom(ref m)) if m == "original"));
        assert_eq!(calls(&log), vec!["rollback:6", "close:6"]);
    }

    #[tokio::test]
    async fn close_failure_after_panic_still_tears_down() {
        let log = new_log();

        let task = tokio::spawn({
            let log = Arc::clone(&log);
            async move {
                let _: Result<(), TestError> = open_scope(
                    move || async move {
                        let mut session = FakeSession::new(12, &log);
                        session.fail_close = true;
                        Ok(session)
                    },
                    async { explode("handler blew up") },
                )
                .await;
            }
        });

        let err = task.await.expect_err("task should panic");
        assert!(err.is_panic());
        assert_eq!(calls(&log), vec!["rollback:12", "close:12"]);
    }

    #[test]
    fn reentrant_use_reports_busy_instead_of_blocking() {
        let log = new_log();
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::spawn({
            let log = Arc::clone(&log);
            move || {
                let result: Result<(), TestError> = open_scope_blocking(
                    || Ok(FakeSession::new(21, &log)),
                    || {
                        current_session::<FakeSession>()?.with(|_| -> Result<(), SessionError> {
                            current_session::<FakeSession>()?.commit()
                        })??;
                        Ok(())
                    },
                );
                let _ = tx.send(result);
            }
        });

        let result = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("nested use must not hang the scope");
        assert!(matches!(
            result,
            Err(TestError::Session(SessionError::Busy))
        ));
        assert_eq!(calls(&log), vec!["rollback:21", "close:21"]);
    }

    #[tokio::test]
    async fn cancelled_scope_defers_teardown_while_session_is_borrowed() {
        let log = new_log();
        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let scope = open_scope::<_, _, _, _, (), TestError>(
            {
                let log = Arc::clone(&log);
                move || async move { Ok(FakeSession::new(31, &log)) }
            },
            async move {
                let session = current_session::<FakeSession>()?;
                let _ = tokio::task::spawn_blocking(move || {
                    session.with(|_| {
                        let _ = locked_tx.send(());
                        let _ = release_rx.recv_timeout(Duration::from_secs(2));
                    })
                });
                let _ = locked_rx.await;
                std::future::pending::<()>().await;
                Ok(())
            },
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(50), scope).await;

        assert!(timed_out.is_err(), "body never completes");
        assert!(calls(&log).is_empty(), "teardown waits for the borrower");

        let _ = release_tx.send(());
        for _ in 0..200 {
            if calls(&log).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls(&log), vec!["rollback:31", "close:31"]);
    }

    #[tokio::test]
    async fn commit_is_never_implicit() {
        let log = new_log();

        let result: Result<(), TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                move || async move { Ok(FakeSession::new(5, &log)) }
            },
            async {
                current_session::<FakeSession>()?.commit()?;
                Ok(())
            },
        )
        .await;

        result.expect("scope should succeed");
        assert_eq!(calls(&log), vec!["commit:5", "close:5"]);
    }

    #[tokio::test]
    async fn wrong_session_type_is_reported() {
        let log = new_log();

        let result: Result<(), TestError> = open_scope(
            {
                let log = Arc::clone(&log);
                move || async move { Ok(FakeSession::new(1, &log)) }
            },
            async {
                match current_session::<OtherSession>() {
                    Err(SessionError::TypeMismatch { expected, active }) => {
                        assert!(expected.ends_with("OtherSession"));
                        assert!(active.ends_with("FakeSession"));
                    }
                    other => panic!("unexpected lookup result: {other:?}"),
                }
                Ok(())
            },
        )
        .await;

        result.expect("scope should succeed");
    }

    #[tokio::test]
    async fn cancelled_scope_rolls_back_and_closes() {
        let log = new_log();

        let scope = open_scope::<_, _, _, _, (), TestError>(
            {
                let log = Arc::clone(&log);
                move || async move { Ok(FakeSession::new(9, &log)) }
            },
            std::future::pending(),
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(20), scope).await;

        assert!(timed_out.is_err(), "body never completes");
        assert_eq!(calls(&log), vec!["rollback:9", "close:9"]);
    }

    #[tokio::test]
    async fn panicking_task_rolls_back_and_closes() {
        let log = new_log();

        let task = tokio::spawn({
            let log = Arc::clone(&log);
            async move {
                let _: Result<(), TestError> = open_scope(
                    move || async move { Ok(FakeSession::new(11, &log)) },
                    async { explode("handler blew up") },
                )
                .await;
            }
        });

        let err = task.await.expect_err("task should panic");
        assert!(err.is_panic());
        assert_eq!(calls(&log), vec!["rollback:11", "close:11"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_scopes_are_isolated() {
        let log = new_log();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let mut tasks = Vec::new();
        for id in [100, 200] {
            let log = Arc::clone(&log);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                open_scope::<_, _, _, _, (), TestError>(
                    move || async move { Ok(FakeSession::new(id, &log)) },
                    async move {
                        for _ in 0..3 {
                            let seen = current_session::<FakeSession>()?.with(|s| s.id)?;
                            assert_eq!(seen, id);
                            barrier.wait().await;
                            tokio::task::yield_now().await;
                        }
                        Ok(())
                    },
                )
                .await
            }));
        }

        for task in tasks {
            task.await
                .expect("task should not panic")
                .expect("scope should succeed");
        }

        let mut closes: Vec<String> = calls(&log);
        closes.sort();
        assert_eq!(closes, vec!["close:100", "close:200"]);
    }

    #[test]
    fn blocking_scope_success_and_failure() {
        let log = new_log();

        let ok: Result<usize, TestError> = open_scope_blocking(
            || Ok(FakeSession::new(1, &log)),
            || Ok(current_session::<FakeSession>()?.with(|s| s.id)?),
        );
        assert_eq!(ok.expect("scope should succeed"), 1);

        let failed: Result<(), TestError> = open_scope_blocking(
            || Ok(FakeSession::new(2, &log)),
            || Err(TestError::Boom("sync".to_string())),
        );
        assert!(matches!(failed, Err(TestError::Boom(_))));

        assert_eq!(calls(&log), vec!["close:1", "rollback:2", "close:2"]);
        assert!(!has_active_session());
    }

    #[test]
    fn blocking_scope_panic_rolls_back_and_closes() {
        let log = new_log();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), TestError> = open_scope_blocking(
                || Ok(FakeSession::new(3, &log)),
                || explode("worker blew up"),
            );
        }));

        assert!(outcome.is_err());
        assert_eq!(calls(&log), vec!["rollback:3", "close:3"]);
        assert!(!has_active_session());
    }

    #[test]
    fn blocking_scopes_on_separate_threads_are_isolated() {
        let log = new_log();

        let workers: Vec<_> = [1usize, 2]
            .into_iter()
            .map(|id| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    open_scope_blocking::<_, _, _, _, TestError>(
                        || Ok(FakeSession::new(id, &log)),
                        || {
                            std::thread::sleep(Duration::from_millis(5));
                            let seen = current_session::<FakeSession>()?.with(|s| s.id)?;
                            assert_eq!(seen, id);
                            Ok(())
                        },
                    )
                })
            })
            .collect();

        for worker in workers {
            worker
                .join()
                .expect("worker should not panic")
                .expect("scope should succeed");
        }
    }
}
