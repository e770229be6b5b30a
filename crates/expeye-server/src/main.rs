//! expeye server binary.
//!
//! Starts an axum HTTP server with structured logging, a pooled SQLite
//! session factory, and graceful shutdown on SIGTERM/SIGINT.

use expeye_server::config::{self, SettingsOverrides};
use expeye_server::{app, logging, AppState};
use std::net::SocketAddr;
use tokio::net::TcpListener;

fn wants_version() -> bool {
    std::env::args()
        .skip(1)
        .any(|arg| arg == "--version" || arg == "-V")
}

fn resolve_config_path() -> (String, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty() && !value.starts_with('-'))
    {
        return (path, "cli-arg");
    }

    if let Ok(path) = std::env::var(config::CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return (path, "env-var");
        }
    }

    (config::DEFAULT_CONFIG_PATH.to_string(), "default")
}

#[tokio::main]
async fn main() {
    if wants_version() {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let (config_path, config_source) = resolve_config_path();

    let settings = config::load_settings(Some(config_path.as_str()), &SettingsOverrides::default())
        .expect("failed to load configuration");

    logging::init_logging(&settings.logging).expect("failed to initialise logging");

    tracing::info!(
        source = config_source,
        path = %config_path,
        "resolved startup configuration path"
    );

    let sessions = expeye_db::SessionFactory::from_settings(
        &settings.db.path,
        settings.db.runtime_settings(),
    )
    .expect("failed to create database pool");

    tracing::info!(
        path = %settings.db.path,
        pool = settings.db.pool,
        overflow = settings.db.overflow,
        "database pool ready"
    );

    let addr = SocketAddr::new(settings.server.host, settings.server.port);
    let app = app(AppState::new(settings, sessions));

    tracing::info!(%addr, "starting expeye server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("expeye server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
