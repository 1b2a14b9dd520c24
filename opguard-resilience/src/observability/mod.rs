//! Logging and metrics setup for processes embedding the substrate.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};
pub use metrics::{init_metrics, render_metrics, MetricsError, ReliabilityMetrics};
