//! Settings loading from file, environment variables, and caller overrides.
//!
//! Sources, lowest to highest precedence:
//!
//! 1. built-in defaults
//! 2. the config file (JSON, or TOML when the path ends in `.toml`)
//! 3. `EXPEYE_*` environment variables
//! 4. [`SettingsOverrides`] supplied by the caller

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;

use expeye_db::DbRuntimeSettings;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Config file used when neither an explicit path nor `CONFIG_PATH` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Top-level service settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Database and pool settings.
    #[serde(default)]
    pub db: DatabaseConfig,

    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which authentication backend validates credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// Accepts any credentials; for local development.
    Dummy,
    /// Delegates to the authentication microservice at `auth.endpoint`.
    #[default]
    Micro,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dummy => f.write_str("dummy"),
            Self::Micro => f.write_str("micro"),
        }
    }
}

/// Error returned when an auth type string is not recognised.
#[derive(Debug, Error)]
#[error("unknown auth type: {0}")]
pub struct ParseAuthTypeError(String);

impl FromStr for AuthType {
    type Err = ParseAuthTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dummy" => Ok(Self::Dummy),
            "micro" => Ok(Self::Micro),
            other => Err(ParseAuthTypeError(other.to_string())),
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// URL of the authentication service.
    #[serde(default = "default_auth_endpoint")]
    pub endpoint: String,

    /// Authentication backend.
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,

    /// Name of the cookie carrying the session token.
    #[serde(default = "default_cookie_key")]
    pub cookie_key: String,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Connections kept open while idle.
    #[serde(default = "default_pool")]
    pub pool: u32,

    /// Extra connections allowed under load.
    #[serde(default = "default_overflow")]
    pub overflow: u32,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// How long a request waits for a free connection, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Pool tunables derived from this configuration.
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_size: self.pool,
            max_overflow: self.overflow,
            connection_timeout_ms: self.connection_timeout_ms,
        }
    }
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "expeye_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Request paths left out of the access log.
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,
}

fn default_auth_endpoint() -> String {
    "https://localhost/auth".to_string()
}

fn default_cookie_key() -> String {
    "cookie_key".to_string()
}

fn default_db_path() -> String {
    "expeye.db".to_string()
}

fn default_pool() -> u32 {
    3
}

fn default_overflow() -> u32 {
    6
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_excluded_paths() -> Vec<String> {
    vec!["/docs".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            endpoint: default_auth_endpoint(),
            auth_type: AuthType::default(),
            cookie_key: default_cookie_key(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool: default_pool(),
            overflow: default_overflow(),
            busy_timeout_ms: default_busy_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            excluded_paths: default_excluded_paths(),
        }
    }
}

/// Values supplied directly by the caller. They win over every other source.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    /// Replaces `auth.endpoint`.
    pub auth_endpoint: Option<String>,
    /// Replaces `auth.type`.
    pub auth_type: Option<AuthType>,
    /// Replaces `auth.cookie_key`.
    pub cookie_key: Option<String>,
    /// Replaces `db.path`.
    pub db_path: Option<String>,
    /// Replaces `db.pool`.
    pub db_pool: Option<u32>,
    /// Replaces `db.overflow`.
    pub db_overflow: Option<u32>,
    /// Replaces `db.busy_timeout_ms`.
    pub db_busy_timeout_ms: Option<u64>,
    /// Replaces `db.connection_timeout_ms`.
    pub db_connection_timeout_ms: Option<u64>,
    /// Replaces `server.host`.
    pub host: Option<IpAddr>,
    /// Replaces `server.port`.
    pub port: Option<u16>,
    /// Replaces `logging.level`.
    pub log_level: Option<String>,
    /// Replaces `logging.json`.
    pub log_json: Option<bool>,
}

impl SettingsOverrides {
    fn apply(&self, settings: &mut Settings) {
        if let Some(endpoint) = &self.auth_endpoint {
            settings.auth.endpoint = endpoint.clone();
        }
        if let Some(auth_type) = self.auth_type {
            settings.auth.auth_type = auth_type;
        }
        if let Some(cookie_key) = &self.cookie_key {
            settings.auth.cookie_key = cookie_key.clone();
        }
        if let Some(path) = &self.db_path {
            settings.db.path = path.clone();
        }
        if let Some(pool) = self.db_pool {
            settings.db.pool = pool;
        }
        if let Some(overflow) = self.db_overflow {
            settings.db.overflow = overflow;
        }
        if let Some(busy_timeout_ms) = self.db_busy_timeout_ms {
            settings.db.busy_timeout_ms = busy_timeout_ms;
        }
        if let Some(connection_timeout_ms) = self.db_connection_timeout_ms {
            settings.db.connection_timeout_ms = connection_timeout_ms;
        }
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
        if let Some(json) = self.log_json {
            settings.logging.json = json;
        }
    }
}

/// Errors that can occur when loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse a JSON configuration file.
    #[error("failed to parse config file: {0}")]
    ParseJson(#[from] serde_json::Error),

    /// Failed to parse a TOML configuration file.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

/// The config file path from `CONFIG_PATH`, or [`DEFAULT_CONFIG_PATH`].
pub fn default_config_path() -> String {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Loads settings from a file, the environment, and caller overrides.
///
/// When `path` is `None` the file named by [`default_config_path`] is used.
/// A missing file yields defaults.
///
/// Environment variable overrides:
/// - `EXPEYE_AUTH_ENDPOINT` overrides `auth.endpoint`
/// - `EXPEYE_AUTH_TYPE` overrides `auth.type` (`dummy` or `micro`)
/// - `EXPEYE_COOKIE_KEY` overrides `auth.cookie_key`
/// - `EXPEYE_DB_PATH` overrides `db.path`
/// - `EXPEYE_DB_POOL` overrides `db.pool`
/// - `EXPEYE_DB_OVERFLOW` overrides `db.overflow`
/// - `EXPEYE_DB_BUSY_TIMEOUT_MS` overrides `db.busy_timeout_ms`
/// - `EXPEYE_DB_CONNECTION_TIMEOUT_MS` overrides `db.connection_timeout_ms`
/// - `EXPEYE_HOST` overrides `server.host`
/// - `EXPEYE_PORT` overrides `server.port`
/// - `EXPEYE_LOG_LEVEL` overrides `logging.level`
/// - `EXPEYE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_settings(
    path: Option<&str>,
    overrides: &SettingsOverrides,
) -> Result<Settings, ConfigError> {
    let path = path
        .map(str::to_string)
        .unwrap_or_else(default_config_path);

    let mut settings = read_settings_file(Path::new(&path))?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    overrides.apply(&mut settings);

    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<Settings, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Settings::default());
        }
        Err(e) => return Err(ConfigError::FileRead(e)),
    };

    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        Ok(toml::from_str(&contents)?)
    } else {
        Ok(serde_json::from_str(&contents)?)
    }
}

fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(endpoint) = lookup("EXPEYE_AUTH_ENDPOINT") {
        settings.auth.endpoint = endpoint;
    }
    if let Some(auth_type) = parse_env(&lookup, "EXPEYE_AUTH_TYPE") {
        settings.auth.auth_type = auth_type;
    }
    if let Some(cookie_key) = lookup("EXPEYE_COOKIE_KEY") {
        settings.auth.cookie_key = cookie_key;
    }
    if let Some(db_path) = lookup("EXPEYE_DB_PATH") {
        settings.db.path = db_path;
    }
    if let Some(pool) = parse_env(&lookup, "EXPEYE_DB_POOL") {
        settings.db.pool = pool;
    }
    if let Some(overflow) = parse_env(&lookup, "EXPEYE_DB_OVERFLOW") {
        settings.db.overflow = overflow;
    }
    if let Some(busy_timeout_ms) = parse_env(&lookup, "EXPEYE_DB_BUSY_TIMEOUT_MS") {
        settings.db.busy_timeout_ms = busy_timeout_ms;
    }
    if let Some(connection_timeout_ms) = parse_env(&lookup, "EXPEYE_DB_CONNECTION_TIMEOUT_MS") {
        settings.db.connection_timeout_ms = connection_timeout_ms;
    }
    if let Some(host) = parse_env(&lookup, "EXPEYE_HOST") {
        settings.server.host = host;
    }
    if let Some(port) = parse_env(&lookup, "EXPEYE_PORT") {
        settings.server.port = port;
    }
    if let Some(level) = lookup("EXPEYE_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Some(json) = lookup("EXPEYE_LOG_JSON") {
        settings.logging.json = json == "true" || json == "1";
    }
}

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
