//! Process-wide `tracing` subscriber setup.
//!
//! Output goes to stderr, in the format chosen by configuration, behind an
//! [`EnvFilter`] built from `log_filter`. The subscriber is global, so only
//! the first [`initialise`] call in a process installs one.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use courier_config::{Config, LogFormat};

static INSTALLED: OnceCell<LogFormat> = OnceCell::new();

/// Proof that logging has been installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
}

impl TelemetryHandle {
    /// Format of the subscriber actually installed, which may differ from
    /// the caller's configuration when another call got there first.
    #[must_use]
    pub fn format(&self) -> LogFormat {
        self.format
    }
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured log filter did not parse.
    #[error("invalid log filter `{filter}`: {message}")]
    Filter {
        /// Filter as configured.
        filter: String,
        /// Parser diagnostic.
        message: String,
    },
    /// Another global subscriber was already installed.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global subscriber described by `config`.
///
/// ```rust
/// use courier_config::Config;
/// use courier::telemetry;
///
/// # fn main() -> Result<(), courier::TelemetryError> {
/// let handle = telemetry::initialise(&Config::named("docs"))?;
/// let again = telemetry::initialise(&Config::named("docs"))?;
/// assert_eq!(handle, again);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Fails when the filter does not parse or a foreign subscriber is already
/// in place.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    let format = INSTALLED.get_or_try_init(|| install(config))?;
    Ok(TelemetryHandle { format: *format })
}

fn filter_for(config: &Config) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(config.log_filter()).map_err(|error| TelemetryError::Filter {
        filter: config.log_filter().to_owned(),
        message: error.to_string(),
    })
}

fn install(config: &Config) -> Result<LogFormat, TelemetryError> {
    let filter = filter_for(config)?;
    let format = config.log_format();

    let output = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(true)
        .with_timer(UtcTime::rfc_3339());
    let output = match format {
        LogFormat::Json => output.json().flatten_event(true).boxed(),
        LogFormat::Compact => output.compact().boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(output);
    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)?;
    tracing::debug!(
        target: concat!(env!("CARGO_PKG_NAME"), "::telemetry"),
        display_name = %config.display_name,
        format = %format,
        "telemetry installed"
    );
    Ok(format)
}
