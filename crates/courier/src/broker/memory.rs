//! In-process broker with direct-exchange semantics.
//!
//! [`MemoryBroker`] models the subset of AMQP the RPC channel relies on:
//! direct exchanges delivering to every queue bound under the routing key,
//! mandatory publishes that report [`PublishOutcome::Returned`] when nothing
//! is bound, and exclusive queues that disappear together with their
//! bindings when the owning transport closes. Several servers sharing one
//! `MemoryBroker` behave like several processes sharing a real broker.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::BROKER_TARGET;
use super::errors::BrokerError;
use super::transport::{
    BrokerTransport, Delivery, DeliveryReceiver, GLOBAL_EXCHANGE, MessageProperties,
    PublishOutcome, SCOPED_EXCHANGE,
};

#[derive(Debug)]
struct Queue {
    sender: mpsc::UnboundedSender<Delivery>,
    // Held until the first consumer attaches so early messages are kept.
    receiver: Option<DeliveryReceiver>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    // (exchange, routing key) -> bound queues
    bindings: HashMap<(String, String), BTreeSet<String>>,
}

impl BrokerState {
    fn remove_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
        self.bindings.retain(|_, queues| {
            queues.remove(queue);
            !queues.is_empty()
        });
    }
}

/// Shared in-process broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection to this broker.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            owned_queues: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live queues.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Queues bound on `exchange` under `routing_key`.
    #[must_use]
    pub fn bound_queues(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        self.state
            .lock()
            .bindings
            .get(&(exchange.to_owned(), routing_key.to_owned()))
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// One connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    owned_queues: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

fn is_rpc_exchange(exchange: &str) -> bool {
    exchange == GLOBAL_EXCHANGE || exchange == SCOPED_EXCHANGE
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.queues.contains_key(queue) {
            let (sender, receiver) = mpsc::unbounded_channel();
            state.queues.insert(
                queue.to_owned(),
                Queue {
                    sender,
                    receiver: Some(receiver),
                },
            );
            self.owned_queues.lock().push(queue.to_owned());
        }
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::unknown_queue(queue));
        }
        state
            .bindings
            .entry((exchange.to_owned(), routing_key.to_owned()))
            .or_default()
            .insert(queue.to_owned());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishOutcome, BrokerError> {
        self.ensure_open()?;
        if !is_rpc_exchange(exchange) {
            return Ok(PublishOutcome::Returned);
        }
        let state = self.broker.state.lock();
        let Some(bound) = state
            .bindings
            .get(&(exchange.to_owned(), routing_key.to_owned()))
        else {
            trace!(target: BROKER_TARGET, exchange, routing_key, "no binding; returning message");
            return Ok(PublishOutcome::Returned);
        };
        let mut routed = false;
        for name in bound {
            if let Some(queue) = state.queues.get(name) {
                let delivery = Delivery {
                    properties: properties.clone(),
                    body: body.clone(),
                };
                routed |= queue.sender.send(delivery).is_ok();
            }
        }
        Ok(if routed {
            PublishOutcome::Routed
        } else {
            PublishOutcome::Returned
        })
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let state = self.broker.state.lock();
        match state.queues.get(queue) {
            Some(target) => {
                // Dropped like the default exchange would once the consumer
                // is gone.
                if target.sender.send(Delivery { properties, body }).is_err() {
                    trace!(target: BROKER_TARGET, queue, "dropping message for closed consumer");
                }
            }
            None => trace!(target: BROKER_TARGET, queue, "dropping message for unknown queue"),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryReceiver, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::unknown_queue(queue))?;
        if let Some(receiver) = entry.receiver.take() {
            return Ok(receiver);
        }
        // Single consumer per queue: a second consume replaces the first.
        let (sender, receiver) = mpsc::unbounded_channel();
        entry.sender = sender;
        Ok(receiver)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let queues = std::mem::take(&mut *self.owned_queues.lock());
        let mut state = self.broker.state.lock();
        for queue in &queues {
            state.remove_queue(queue);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::broker::transport::MessageKind;

    #[fixture]
    fn broker() -> MemoryBroker {
        MemoryBroker::new()
    }

    fn properties() -> MessageProperties {
        MessageProperties::new(MessageKind::Request, "test", "trace-1")
    }

    #[rstest]
    #[tokio::test]
    async fn unbound_publish_is_returned(broker: MemoryBroker) {
        let transport = broker.transport();
        let outcome = transport
            .publish(GLOBAL_EXCHANGE, "global::echo::1", b"{}".to_vec(), properties())
            .await
            .expect("publish");
        assert_eq!(outcome, PublishOutcome::Returned);
    }

    #[rstest]
    #[tokio::test]
    async fn bound_publish_reaches_consumer(broker: MemoryBroker) {
        let transport = broker.transport();
        transport.declare_queue("a-rpc-1").await.expect("declare");
        transport
            .bind("a-rpc-1", GLOBAL_EXCHANGE, "global::echo::1")
            .await
            .expect("bind");
        let mut deliveries = transport.consume("a-rpc-1").await.expect("consume");

        let outcome = transport
            .publish(GLOBAL_EXCHANGE, "global::echo::1", b"{}".to_vec(), properties())
            .await
            .expect("publish");
        assert_eq!(outcome, PublishOutcome::Routed);
        let delivery = deliveries.recv().await.expect("delivery");
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("trace-1"));
    }

    #[rstest]
    #[tokio::test]
    async fn exchanges_are_separate(broker: MemoryBroker) {
        let transport = broker.transport();
        transport.declare_queue("q").await.expect("declare");
        transport
            .bind("q", SCOPED_EXCHANGE, "global::echo::1")
            .await
            .expect("bind");
        let outcome = transport
            .publish(GLOBAL_EXCHANGE, "global::echo::1", Vec::new(), properties())
            .await
            .expect("publish");
        assert_eq!(outcome, PublishOutcome::Returned);
    }

    #[rstest]
    #[tokio::test]
    async fn closing_removes_queues_and_bindings(broker: MemoryBroker) {
        let owner = broker.transport();
        owner.declare_queue("q").await.expect("declare");
        owner.bind("q", GLOBAL_EXCHANGE, "k").await.expect("bind");
        assert_eq!(broker.bound_queues(GLOBAL_EXCHANGE, "k"), vec!["q".to_owned()]);

        owner.close().await.expect("close");
        assert_eq!(broker.queue_count(), 0);
        assert!(broker.bound_queues(GLOBAL_EXCHANGE, "k").is_empty());

        let other = broker.transport();
        let outcome = other
            .publish(GLOBAL_EXCHANGE, "k", Vec::new(), properties())
            .await
            .expect("publish");
        assert_eq!(outcome, PublishOutcome::Returned);
        assert!(matches!(
            owner.declare_queue("again").await,
            Err(BrokerError::Closed)
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn binding_unknown_queue_fails(broker: MemoryBroker) {
        let transport = broker.transport();
        let result = transport.bind("missing", GLOBAL_EXCHANGE, "k").await;
        assert!(matches!(result, Err(BrokerError::UnknownQueue { .. })));
    }

    #[rstest]
    #[tokio::test]
    async fn send_to_unknown_queue_is_dropped(broker: MemoryBroker) {
        let transport = broker.transport();
        transport
            .send_to_queue("nowhere", Vec::new(), properties())
            .await
            .expect("send is not an error");
    }
}
