//! Shared configuration for the Courier RPC dispatch daemon.
//!
//! Values are layered by [`ortho_config`]: built-in defaults, then a
//! configuration file (`--config-path` or `COURIER_CONFIG_PATH`), then
//! `COURIER_*` environment variables, then command-line flags. The resolved
//! [`Config`] is immutable; the daemon wraps it in an `Arc` and hands it to
//! every component at construction time.

mod broker;
mod defaults;
mod logging;

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use broker::{BrokerUri, BrokerUriError};
pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_RPC_TIMEOUT_MS,
    DEFAULT_SHUTDOWN_TIMEOUT_MS, default_log_filter, default_log_filter_string,
    default_log_format, default_reconnect_delay_ms, default_rpc_timeout_ms,
    default_shutdown_timeout_ms,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Resolved daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, OrthoConfig)]
#[ortho_config(prefix = "COURIER")]
pub struct Config {
    /// Human-readable server name. Used for the broker queue name and the
    /// `appId` of every published message.
    pub display_name: String,
    /// Unique id of this process instance. Generated when absent.
    #[serde(default)]
    pub ephemeral_id: Option<String>,
    /// AMQP broker URI. Without it the server has no remote path.
    #[serde(default)]
    pub amqp_uri: Option<String>,
    /// Milliseconds a remote call waits for its correlated reply.
    #[serde(default = "defaults::default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Upper bound on broker teardown during shutdown.
    #[serde(default = "defaults::default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Delay between broker reconnection attempts.
    #[serde(default = "defaults::default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// `tracing` filter expression.
    #[serde(default = "defaults::default_log_filter_string")]
    pub log_filter: String,
    /// Log output format.
    #[serde(default = "defaults::default_log_format")]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            ephemeral_id: None,
            amqp_uri: None,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

/// Errors raised by [`Config::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `display_name` was empty or whitespace.
    #[error("display_name is required")]
    MissingDisplayName,
    /// `amqp_uri` did not parse as a broker URI.
    #[error("invalid amqp_uri: {0}")]
    BrokerUri(#[from] BrokerUriError),
    /// A timeout was configured as zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Name of the offending field.
        field: &'static str,
    },
}

impl Config {
    /// Builds a configuration with the given display name and defaults
    /// elsewhere.
    #[must_use]
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Checks the invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first violated field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.display_name.trim().is_empty() {
            return Err(ConfigError::MissingDisplayName);
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "rpc_timeout_ms",
            });
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "shutdown_timeout_ms",
            });
        }
        self.broker_uri()?;
        Ok(())
    }

    /// Display name with surrounding whitespace removed.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.display_name.trim()
    }

    /// Parsed broker URI, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerUriError`] when the configured value is not an
    /// `amqp://` or `amqps://` URL.
    pub fn broker_uri(&self) -> Result<Option<BrokerUri>, BrokerUriError> {
        match self.amqp_uri.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some),
        }
    }

    /// Remote call deadline.
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Broker teardown bound.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Pause between reconnection attempts.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}
