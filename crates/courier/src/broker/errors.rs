//! Error types for the broker transport and channel.

use thiserror::Error;

/// Errors surfaced by broker transports and the RPC channel.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The initial connection to the broker failed.
    #[error("failed to connect to broker at {endpoint}: {source}")]
    Connect {
        /// Broker endpoint with credentials removed.
        endpoint: String,
        /// Underlying client error.
        #[source]
        source: lapin::Error,
    },

    /// An AMQP operation failed.
    #[error("AMQP operation '{operation}' failed: {source}")]
    Amqp {
        /// Operation that failed, for example `queue_bind`.
        operation: &'static str,
        /// Underlying client error.
        #[source]
        source: lapin::Error,
    },

    /// The transport has no live connection at the moment.
    #[error("broker connection is not available")]
    Disconnected,

    /// The transport was closed and cannot be used again.
    #[error("broker transport is closed")]
    Closed,

    /// The named queue does not exist.
    #[error("unknown queue: {queue}")]
    UnknownQueue {
        /// Queue name.
        queue: String,
    },

    /// A wire envelope could not be encoded or decoded.
    #[error("invalid RPC envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// Tearing the transport down took longer than allowed.
    #[error("broker shutdown did not finish within {timeout_ms} ms")]
    ShutdownTimedOut {
        /// Limit that was exceeded.
        timeout_ms: u128,
    },
}

impl BrokerError {
    /// Wraps an AMQP client error with the failing operation.
    #[must_use]
    pub fn amqp(operation: &'static str, source: lapin::Error) -> Self {
        Self::Amqp { operation, source }
    }

    /// Creates an unknown queue error.
    pub fn unknown_queue(queue: impl Into<String>) -> Self {
        Self::UnknownQueue {
            queue: queue.into(),
        }
    }
}
