//! The seam between the RPC channel and a concrete message broker.
//!
//! The channel only needs a handful of primitives: two direct exchanges, one
//! exclusive queue per process, bindings on that queue, publishing with a
//! mandatory flag that reports unroutable messages, and a stream of
//! deliveries. [`BrokerTransport`] captures exactly that so the same channel
//! runs over AMQP or over the in-process [`MemoryBroker`].
//!
//! [`MemoryBroker`]: super::MemoryBroker

use async_trait::async_trait;
use strum::{Display, EnumString, IntoStaticStr};
use tokio::sync::mpsc;

use super::errors::BrokerError;
use crate::model::RoutingKey;

/// Exchange carrying requests in the global scope.
pub const GLOBAL_EXCHANGE: &str = "rpc-global";

/// Exchange carrying requests in every other scope.
pub const SCOPED_EXCHANGE: &str = "rpc-scoped";

/// Exchange a routing key is published to and bound on.
#[must_use]
pub fn exchange_for(key: &RoutingKey) -> &'static str {
    if key.is_global() {
        GLOBAL_EXCHANGE
    } else {
        SCOPED_EXCHANGE
    }
}

/// Value of the `type` message property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    /// A call awaiting a reply.
    Request,
    /// A reply to an earlier request.
    Response,
}

impl MessageKind {
    /// Wire form of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Metadata carried alongside every message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Display name of the sending process.
    pub app_id: Option<String>,
    /// Trace id of the request the message belongs to.
    pub correlation_id: Option<String>,
    /// Raw `type` property; see [`MessageKind`].
    pub kind: Option<String>,
    /// Queue replies should be sent to.
    pub reply_to: Option<String>,
}

impl MessageProperties {
    /// Properties for an outgoing message of `kind`.
    pub fn new(kind: MessageKind, app_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            correlation_id: Some(correlation_id.into()),
            kind: Some(kind.as_str().to_owned()),
            reply_to: None,
        }
    }

    /// Sets the reply queue.
    #[must_use]
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Parsed `type` property; `None` when absent or unrecognized.
    #[must_use]
    pub fn message_kind(&self) -> Option<MessageKind> {
        self.kind.as_deref().and_then(|kind| kind.parse().ok())
    }
}

/// A message taken off a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Message metadata.
    pub properties: MessageProperties,
    /// Raw body.
    pub body: Vec<u8>,
}

/// Result of a mandatory publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// At least one queue accepted the message.
    Routed,
    /// No queue was bound for the routing key; the broker handed the message
    /// back.
    Returned,
}

/// Receiving end of a queue consumer.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Minimal broker surface used by the RPC channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Declares both RPC exchanges and an exclusive, auto-delete,
    /// non-durable queue named `queue`.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Binds `queue` to `exchange` under `routing_key`.
    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Publishes with the mandatory flag set.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishOutcome, BrokerError>;

    /// Sends directly to a named queue. Unknown queues drop the message.
    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Starts consuming `queue` without acknowledgements.
    async fn consume(&self, queue: &str) -> Result<DeliveryReceiver, BrokerError>;

    /// Closes the transport. Exclusive queues and their bindings go away.
    async fn close(&self) -> Result<(), BrokerError>;
}
