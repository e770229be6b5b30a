//! API handlers for the expeye server.

use crate::auth::{AuthCredentials, AuthError};
use crate::AppState;
use axum::{
    extract::{Extension, Json},
    http::{header::WWW_AUTHENTICATE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use expeye_db::{current_session, DbSession, SessionError};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(#[from] AuthError),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        if err.is_unavailable() {
            tracing::warn!(error = %err, "database unavailable");
            ApiError::ServiceUnavailable(err.to_string())
        } else {
            tracing::error!(error = %err, "database session error");
            ApiError::InternalServerError(err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized(err) => (StatusCode::UNAUTHORIZED, err.to_string()),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "detail": message
        }));

        let mut response = (status, body).into_response();
        if matches!(self, ApiError::Unauthorized(_)) {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Runs `SELECT 1` through the request's session.
async fn check_database() -> Result<(), ApiError> {
    let session = current_session::<DbSession>()?;

    tokio::task::spawn_blocking(move || -> Result<(), SessionError> {
        session.with(|s| {
            s.connection()
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(SessionError::from)
        })?
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("database check task failed: {e}")))??;

    Ok(())
}

/// Handler for `GET /health`.
///
/// Always `200 OK`; the `database` field reports whether the request's
/// session can reach the database.
pub async fn health_handler() -> Json<Value> {
    let database = match check_database().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "database health check failed");
            "error"
        }
    };

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "database": database
    }))
}

/// Handler for `GET /api/whoami`.
pub async fn whoami_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(credentials): Extension<AuthCredentials>,
) -> Result<Json<Value>, ApiError> {
    check_database().await?;

    Ok(Json(json!({
        "scheme": credentials.scheme,
        "authType": state.settings.auth.auth_type.to_string(),
        "authEndpoint": state.settings.auth.endpoint
    })))
}
