//! Process-wide `tracing` subscriber setup.
//!
//! The runtime only emits `tracing` events and spans; installing a subscriber
//! is left to the host. [`init`] is a convenience for binaries and tests that
//! want the standard layout: an `EnvFilter` (`RUST_LOG` wins over
//! `logLevel`) feeding either a plain or a JSON formatter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::HemeraConfig;

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter `{directive}`: {reason}")]
    Filter { directive: String, reason: String },
    #[error("a global subscriber is already installed")]
    AlreadyInstalled,
}

/// Builds the filter: `RUST_LOG` when set, `directive` otherwise.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] when `directive` does not parse.
pub fn build_filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(directive).map_err(|e| LoggingError::Filter {
        directive: directive.to_string(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber for `config.log_level`.
///
/// # Errors
///
/// Fails when the filter is invalid or a subscriber is already installed.
pub fn init(config: &HemeraConfig, format: LogFormat) -> Result<(), LoggingError> {
    let filter = build_filter(&config.log_level)?;

    let layer = match format {
        LogFormat::Plain => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInstalled)
}
