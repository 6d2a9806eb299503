//! Operator-facing health of a running daemon.
//!
//! Startup and shutdown, the broker connection (including silent recoveries
//! by the AMQP supervisor) and the set of routing keys a server answers are
//! all reported through one [`HealthReporter`]. [`StructuredHealthReporter`]
//! turns them into `courier::health` log events.

use std::sync::Arc;

use courier_config::Config;

use crate::bootstrap::BootstrapError;
use crate::broker::{BrokerError, ConnectionObserver, TopologyReplay};
use crate::model::RoutingKey;
use crate::server::ServerError;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// What a server answers once it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingSummary {
    /// Server display name.
    pub display_name: String,
    /// Broker queue receiving remote requests; `None` when standalone.
    pub queue: Option<String>,
    /// Locally registered routing keys, sorted.
    pub handlers: Vec<RoutingKey>,
}

/// Sink for daemon health notices.
#[cfg_attr(test, mockall::automock)]
pub trait HealthReporter: Send + Sync {
    /// Configuration is about to be loaded.
    fn bootstrap_starting(&self);

    /// The daemon is wired up and ready to start serving.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Bootstrap gave up; `error` is also returned to the caller.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// First connection attempt to the broker at `endpoint` (credentials
    /// removed).
    fn broker_connecting(&self, endpoint: &str);

    /// First connection attempt succeeded.
    fn broker_ready(&self, endpoint: &str);

    /// First connection attempt failed; bootstrap aborts.
    fn broker_failed(&self, endpoint: &str, error: &BrokerError);

    /// An established connection dropped. Remote calls fail until it is back.
    fn broker_lost(&self, endpoint: &str);

    /// One reconnection attempt failed; another follows.
    fn broker_reconnect_failed(&self, endpoint: &str, attempt: u32, error: &BrokerError);

    /// The connection is back with its queues, bindings and consumers.
    fn broker_reconnected(&self, endpoint: &str, replay: &TopologyReplay);

    /// The server started answering requests.
    fn serving(&self, summary: &ServingSummary);

    /// The server stopped cleanly.
    fn stopped(&self, display_name: &str);

    /// Tearing the server down failed.
    fn stop_failed(&self, display_name: &str, error: &ServerError);
}

/// Reports through `tracing` on the `courier::health` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Creates the reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(target: HEALTH_TARGET, event = "bootstrap_starting", "loading configuration");
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            display_name = %config.display_name(),
            remote = config.amqp_uri.is_some(),
            rpc_timeout_ms = config.rpc_timeout_ms,
            "daemon ready to serve"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(target: HEALTH_TARGET, event = "bootstrap_failed", error = %error, "daemon cannot start");
    }

    fn broker_connecting(&self, endpoint: &str) {
        tracing::info!(target: HEALTH_TARGET, event = "broker_connecting", endpoint, "connecting to broker");
    }

    fn broker_ready(&self, endpoint: &str) {
        tracing::info!(target: HEALTH_TARGET, event = "broker_ready", endpoint, "broker connected");
    }

    fn broker_failed(&self, endpoint: &str, error: &BrokerError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "broker_failed",
            endpoint,
            error = %error,
            "broker unreachable"
        );
    }

    fn broker_lost(&self, endpoint: &str) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "broker_lost",
            endpoint,
            "broker connection lost; remote calls fail until it is restored"
        );
    }

    fn broker_reconnect_failed(&self, endpoint: &str, attempt: u32, error: &BrokerError) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "broker_reconnect_failed",
            endpoint,
            attempt,
            error = %error,
            "broker still unreachable"
        );
    }

    fn broker_reconnected(&self, endpoint: &str, replay: &TopologyReplay) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "broker_reconnected",
            endpoint,
            attempts = replay.attempts,
            queues = replay.queues,
            bindings = replay.bindings,
            consumers = replay.consumers,
            "broker connection restored"
        );
    }

    fn serving(&self, summary: &ServingSummary) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "serving",
            display_name = %summary.display_name,
            queue = summary.queue.as_deref().unwrap_or("<standalone>"),
            handlers = summary.handlers.len(),
            keys = ?summary.handlers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "serving requests"
        );
    }

    fn stopped(&self, display_name: &str) {
        tracing::info!(target: HEALTH_TARGET, event = "stopped", display_name, "server stopped");
    }

    fn stop_failed(&self, display_name: &str, error: &ServerError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "stop_failed",
            display_name,
            error = %error,
            "server stopped uncleanly"
        );
    }
}

/// Relays the AMQP supervisor's notices to a [`HealthReporter`].
pub(crate) struct BrokerHealth {
    reporter: Arc<dyn HealthReporter>,
}

impl BrokerHealth {
    pub(crate) fn new(reporter: Arc<dyn HealthReporter>) -> Self {
        Self { reporter }
    }
}

impl ConnectionObserver for BrokerHealth {
    fn connection_lost(&self, endpoint: &str) {
        self.reporter.broker_lost(endpoint);
    }

    fn reconnect_failed(&self, endpoint: &str, attempt: u32, error: &BrokerError) {
        self.reporter.broker_reconnect_failed(endpoint, attempt, error);
    }

    fn reconnected(&self, endpoint: &str, replay: &TopologyReplay) {
        self.reporter.broker_reconnected(endpoint, replay);
    }
}
