//! Logging setup
//!
//! Installs a console `tracing` subscriber for processes embedding the
//! engine. Libraries never call this; binaries and test harnesses do.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Filter directives, e.g. `info,waypoint_durable=debug`
    pub log_filter: Option<String>,
    /// Include the event target (module path) in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// - `RUST_LOG`: filter directives
    /// - `LOG_LEVEL`: fallback when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            ..Default::default()
        }
    }

    fn filter(&self, default_filter: &str) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(default_filter))
    }
}

/// Install the global subscriber
///
/// Falls back to `default_filter` when no usable filter is configured.
/// Returns false when a global subscriber was already installed.
///
/// ```ignore
/// use waypoint_durable::telemetry::{init_tracing, TelemetryConfig};
///
/// init_tracing(TelemetryConfig::from_env(), "info");
/// ```
pub fn init_tracing(config: TelemetryConfig, default_filter: &str) -> bool {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(config.filter(default_filter));

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_falls_back() {
        let config = TelemetryConfig {
            log_filter: Some("waypoint=loudest".to_string()),
            ..Default::default()
        };
        assert_eq!(config.filter("warn").to_string(), "warn");
    }

    #[test]
    fn test_configured_filter_wins() {
        let config = TelemetryConfig {
            log_filter: Some("debug".to_string()),
            ..Default::default()
        };
        assert_eq!(config.filter("warn").to_string(), "debug");
    }
}
