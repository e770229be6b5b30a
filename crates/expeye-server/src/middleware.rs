use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use expeye_db::{open_scope, SessionError};
use std::sync::Arc;
use std::time::Instant;

use crate::api::ApiError;
use crate::logging::ACCESS_LOG_TARGET;
use crate::AppState;

/// How a request's session scope ended when it did not succeed.
enum ScopeExit {
    /// The handler produced a server error; the session is rolled back.
    Failed(Response),
    /// The scope itself could not be set up or torn down.
    Session(SessionError),
}

impl From<SessionError> for ScopeExit {
    fn from(err: SessionError) -> Self {
        ScopeExit::Session(err)
    }
}

/// Middleware wrapping every request in its own database session scope.
///
/// Handlers reach the session through `expeye_db::current_session`. A 5xx
/// response counts as a failed unit of work: the session is rolled back
/// before it is closed. Anything else only closes it; committing is up to
/// the handler.
pub async fn session_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let sessions = state.sessions.clone();
    let outcome = open_scope(
        // Checking out a connection may block until the pool frees one.
        move || async move {
            tokio::task::spawn_blocking(move || sessions.create())
                .await
                .map_err(|e| SessionError::Backend(format!("session factory task failed: {e}")))?
                .map_err(ScopeExit::from)
        },
        async move {
            let response = next.run(req).await;
            if response.status().is_server_error() {
                Err(ScopeExit::Failed(response))
            } else {
                Ok(response)
            }
        },
    )
    .await;

    Ok(match outcome {
        Ok(response) | Err(ScopeExit::Failed(response)) => response,
        Err(ScopeExit::Session(err)) => ApiError::from(err).into_response(),
    })
}

/// Middleware to authenticate requests via the session cookie or
/// `Authorization: Bearer`.
///
/// Resolved [`AuthCredentials`](crate::auth::AuthCredentials) are inserted
/// into the request extensions. Validating the token against the auth
/// service is left to the handlers that need a user.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or_else(|| ApiError::InternalServerError("application state missing".to_string()))?
        .clone();

    if let Some(credentials) = state.auth.resolve(req.headers())? {
        req.extensions_mut().insert(credentials);
    }

    Ok(next.run(req).await)
}

/// Access log middleware. Emits one event per request on the
/// `expeye::access` target unless the path is excluded.
pub async fn access_log_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    if state.access_log.should_log(&path) {
        tracing::info!(
            target: ACCESS_LOG_TARGET,
            %method,
            path = %path,
            status = response.status().as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "request handled"
        );
    }

    Ok(response)
}
