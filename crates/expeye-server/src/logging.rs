//! Log subscriber setup and access-log filtering.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Target used for per-request access log events.
pub const ACCESS_LOG_TARGET: &str = "expeye::access";

/// The global subscriber could not be installed, usually because one
/// already is.
#[derive(Debug, Error)]
#[error("failed to install log subscriber: {0}")]
pub struct LoggingError(Box<dyn std::error::Error + Send + Sync + 'static>);

/// Installs the global `tracing` subscriber.
///
/// Plain output is `LEVEL message` without timestamps or targets; set
/// `logging.json` for structured output. An invalid `logging.level` falls
/// back to `info`.
///
/// # Errors
///
/// Returns `LoggingError` if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .map_err(LoggingError)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .try_init()
            .map_err(LoggingError)
    }
}

/// Decides which requests appear in the access log.
#[derive(Debug, Clone, Default)]
pub struct AccessLogFilter {
    excluded_paths: Vec<String>,
}

impl AccessLogFilter {
    /// Excludes requests whose path equals one of `paths`.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            excluded_paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds the filter from `logging.excluded_paths`.
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self::new(config.excluded_paths.iter().cloned())
    }

    /// Returns `true` if a request to `path` should be logged.
    pub fn should_log(&self, path: &str) -> bool {
        !self.excluded_paths.iter().any(|excluded| excluded == path)
    }
}
