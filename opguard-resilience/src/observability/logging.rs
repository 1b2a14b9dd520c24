//! Structured logging setup.
//!
//! ```rust,no_run
//! use opguard_resilience::observability::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::default()).expect("Failed to initialize logging");
//! ```

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production (machine-readable)
    Json,
    /// Pretty format for development (human-readable)
    Pretty,
    /// Compact format for minimal output
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Default log level
    pub level: String,
    /// Per-module directives (e.g. "opguard_resilience=debug,config=warn").
    /// Takes precedence over `RUST_LOG` and `level`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "info".to_string(),
            filter: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter: explicit directives, then `RUST_LOG`, then the level.
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    match &config.filter {
        Some(filter) => Ok(EnvFilter::try_new(filter)?),
        None => Ok(EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))?),
    }
}

/// Install the global tracing subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let env_filter = build_filter(config)?;

    match config.format {
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_filter(env_filter);

            tracing_subscriber::registry().with(json_layer).try_init()?;
        }
        LogFormat::Pretty => {
            let pretty_layer = fmt::layer()
                .pretty()
                .with_thread_ids(true)
                .with_filter(env_filter);

            tracing_subscriber::registry()
                .with(pretty_layer)
                .try_init()?;
        }
        LogFormat::Compact => {
            let compact_layer = fmt::layer().compact().with_filter(env_filter);

            tracing_subscriber::registry()
                .with(compact_layer)
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_serde() {
        let format: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(format, LogFormat::Compact);
        assert_eq!(serde_json::to_string(&LogFormat::Json).unwrap(), "\"json\"");
    }

    #[test]
    fn test_build_filter_with_directives() {
        let config = LogConfig {
            filter: Some("opguard_resilience=debug,warn".to_string()),
            ..LogConfig::default()
        };
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn test_build_filter_rejects_garbage() {
        let config = LogConfig {
            filter: Some("opguard_resilience=verbose".to_string()),
            ..LogConfig::default()
        };
        assert!(matches!(build_filter(&config), Err(LoggingError::Filter(_))));
    }
}
