//! # Relay Telemetry
//!
//! Observability for the relay broker.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` registry with an env filter and a
//!   pretty or JSON formatter
//! - **Metrics**: Prometheus gauges mirroring [`relay_bus::StatsSnapshot`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_telemetry::{init_logging, BrokerMetrics, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//!
//! let metrics = BrokerMetrics::register()?;
//! metrics.observe(&broker.stats());
//! println!("{}", metrics.encode()?);
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_SERVICE_NAME` | `relay` | Service name attached to the startup log |
//! | `RELAY_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `RELAY_JSON_LOGS` | `false` | Emit JSON formatted logs |
//! | `RELAY_CONSOLE_OUTPUT` | `true` | Write logs to stdout at all |

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{BrokerMetrics, REGISTRY};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),
}

/// Convenience macro for creating a span tagged with a broker member.
///
/// # Example
///
/// ```rust,ignore
/// use relay_telemetry::member_span;
///
/// let span = member_span!("settle_order", member.handle());
/// async move { /* ... */ }.instrument(span).await;
/// ```
#[macro_export]
macro_rules! member_span {
    ($name:expr, $handle:expr $(, $($field:tt)*)?) => {
        tracing::info_span!($name, member = %$handle $(, $($field)*)?)
    };
}
