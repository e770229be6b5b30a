//! expeye server library logic.
//!
//! Every request runs inside its own database session scope opened by
//! [`middleware::session_middleware`]; handlers reach the session through
//! [`expeye_db::current_session`].

pub mod api;
pub mod auth;
pub mod config;
pub mod logging;
pub mod middleware;

use auth::CookieOrBearer;
use axum::{routing::get, Extension, Router};
use config::Settings;
use expeye_db::SessionFactory;
use logging::AccessLogFilter;
use std::sync::Arc;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Loaded settings.
    pub settings: Settings,
    /// Produces one database session per request.
    pub sessions: SessionFactory,
    /// Credential extractor for protected routes.
    pub auth: CookieOrBearer,
    /// Paths left out of the access log.
    pub access_log: AccessLogFilter,
}

impl AppState {
    /// Builds state from settings, deriving the credential extractor and the
    /// access log filter.
    pub fn new(settings: Settings, sessions: SessionFactory) -> Self {
        let auth = CookieOrBearer::new(settings.auth.cookie_key.clone());
        let access_log = AccessLogFilter::from_config(&settings.logging);
        Self {
            settings,
            sessions,
            auth,
            access_log,
        }
    }
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/whoami", get(api::whoami_handler))
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(api::health_handler))
        .merge(protected_routes)
        .layer(axum::middleware::from_fn(middleware::session_middleware))
        .layer(axum::middleware::from_fn(middleware::access_log_middleware))
        .layer(Extension(Arc::new(state)))
}
