//! Forwarding calls between processes through a message broker.
//!
//! Requests for routing keys no local handler serves are published to the
//! `rpc-global` or `rpc-scoped` direct exchange. Every process binds its own
//! exclusive queue under the keys it serves and receives replies on the same
//! queue. [`AmqpTransport`] talks to a real broker; [`MemoryBroker`] gives the
//! same semantics inside one process.

mod amqp;
mod channel;
mod envelope;
mod errors;
mod manager;
mod memory;
mod transport;

pub(crate) const BROKER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::broker");

pub use amqp::{AmqpTransport, ConnectionObserver, TopologyReplay};
pub use channel::{InboundHandler, RpcChannel, queue_name};
pub use envelope::Envelope;
pub use errors::BrokerError;
pub use manager::{BrokerManager, BrokerOptions};
pub use memory::{MemoryBroker, MemoryTransport};
#[cfg(test)]
pub(crate) use transport::MockBrokerTransport;
pub use transport::{
    BrokerTransport, Delivery, DeliveryReceiver, GLOBAL_EXCHANGE, MessageKind, MessageProperties,
    PublishOutcome, SCOPED_EXCHANGE, exchange_for,
};
