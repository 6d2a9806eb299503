//! Broker lifecycle around one [`RpcChannel`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info};

use super::BROKER_TARGET;
use super::channel::{InboundHandler, RpcChannel};
use super::errors::BrokerError;
use super::transport::BrokerTransport;
use crate::events::{EventBus, RpcEvent};
use crate::model::{CallRequest, CallResponse, RoutingKey};

/// Settings for [`BrokerManager::start`].
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Process name used as `appId` and queue prefix.
    pub display_name: String,
    /// How long a remote call waits for its reply.
    pub rpc_timeout: Duration,
    /// Upper bound on [`BrokerManager::shutdown`].
    pub shutdown_timeout: Duration,
}

/// Owns the broker channel and forwards calls through it.
#[derive(Debug)]
pub struct BrokerManager {
    channel: RpcChannel,
    shutdown_timeout: Duration,
    shut_down: AtomicBool,
}

impl BrokerManager {
    /// Opens the RPC channel over `transport`.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from setting up the process queue.
    pub async fn start(
        transport: Arc<dyn BrokerTransport>,
        options: BrokerOptions,
        events: EventBus<RpcEvent>,
        handler: Weak<dyn InboundHandler>,
    ) -> Result<Self, BrokerError> {
        let channel = RpcChannel::open(
            transport,
            &options.display_name,
            options.rpc_timeout,
            events,
            handler,
        )
        .await?;
        info!(
            target: BROKER_TARGET,
            queue = channel.queue(),
            timeout_ms = options.rpc_timeout.as_millis(),
            "broker channel started"
        );
        Ok(Self {
            channel,
            shutdown_timeout: options.shutdown_timeout,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Forwards `request` to whichever process serves its routing key.
    pub async fn manage_request(&self, request: &CallRequest) -> CallResponse {
        if self.shut_down.load(Ordering::Acquire) {
            return CallResponse::rpc_error(request);
        }
        self.channel.send_request(request).await
    }

    /// Makes this process receive requests for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] after shutdown, or the transport's
    /// binding error.
    pub async fn register_handler(&self, key: &RoutingKey) -> Result<(), BrokerError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        self.channel.subscribe(key).await
    }

    /// Name of the process queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        self.channel.queue()
    }

    /// Closes the channel and the connection. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ShutdownTimedOut`] when closing exceeds the
    /// configured bound, or the transport's close error.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            debug!(target: BROKER_TARGET, "broker already shut down");
            return Ok(());
        }
        tokio::time::timeout(self.shutdown_timeout, self.channel.close())
            .await
            .map_err(|_| BrokerError::ShutdownTimedOut {
                timeout_ms: self.shutdown_timeout.as_millis(),
            })??;
        info!(target: BROKER_TARGET, queue = self.channel.queue(), "broker channel closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, MemoryTransport};
    use crate::broker::transport::{
        DeliveryReceiver, MessageProperties, MockBrokerTransport, PublishOutcome,
    };
    use crate::model::{Trace, status};

    struct Nobody;

    #[async_trait::async_trait]
    impl InboundHandler for Nobody {
        async fn handle_inbound(&self, request: CallRequest) -> CallResponse {
            CallResponse::not_implemented(&request)
        }
    }

    fn options() -> BrokerOptions {
        BrokerOptions {
            display_name: "svc".to_owned(),
            rpc_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_stops_forwarding() {
        let broker = MemoryBroker::new();
        let manager = BrokerManager::start(
            Arc::new(broker.transport()),
            options(),
            EventBus::new(),
            Weak::<Nobody>::new(),
        )
        .await
        .expect("start");
        assert_eq!(broker.queue_count(), 1);

        manager.shutdown().await.expect("first shutdown");
        manager.shutdown().await.expect("second shutdown");
        assert_eq!(broker.queue_count(), 0);

        let request = CallRequest::new(RoutingKey::global("echo"), Trace::external("test"));
        let response = manager.manage_request(&request).await;
        assert_eq!(response.code(), status::INTERNAL_ERROR);
        assert!(matches!(
            manager.register_handler(&RoutingKey::global("echo")).await,
            Err(BrokerError::Closed)
        ));
    }

    struct SlowClose(MemoryTransport);

    #[async_trait::async_trait]
    impl BrokerTransport for SlowClose {
        async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
            self.0.declare_queue(queue).await
        }

        async fn bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), BrokerError> {
            self.0.bind(queue, exchange, key).await
        }

        async fn publish(
            &self,
            exchange: &str,
            key: &str,
            body: Vec<u8>,
            properties: MessageProperties,
        ) -> Result<PublishOutcome, BrokerError> {
            self.0.publish(exchange, key, body, properties).await
        }

        async fn send_to_queue(
            &self,
            queue: &str,
            body: Vec<u8>,
            properties: MessageProperties,
        ) -> Result<(), BrokerError> {
            self.0.send_to_queue(queue, body, properties).await
        }

        async fn consume(&self, queue: &str) -> Result<DeliveryReceiver, BrokerError> {
            self.0.consume(queue).await
        }

        async fn close(&self) -> Result<(), BrokerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.0.close().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_close_is_bounded() {
        let broker = MemoryBroker::new();
        let manager = BrokerManager::start(
            Arc::new(SlowClose(broker.transport())),
            options(),
            EventBus::new(),
            Weak::<Nobody>::new(),
        )
        .await
        .expect("start");

        let result = manager.shutdown().await;
        assert!(matches!(
            result,
            Err(BrokerError::ShutdownTimedOut { timeout_ms: 500 })
        ));
    }

    #[tokio::test]
    async fn binding_failure_is_reported() {
        let mut transport = MockBrokerTransport::new();
        transport.expect_declare_queue().returning(|_| Ok(()));
        transport
            .expect_consume()
            .returning(|_| Ok(tokio::sync::mpsc::unbounded_channel().1));
        transport
            .expect_bind()
            .returning(|_, _, _| Err(BrokerError::Disconnected));
        let manager = BrokerManager::start(
            Arc::new(transport),
            options(),
            EventBus::new(),
            Weak::<Nobody>::new(),
        )
        .await
        .expect("start");

        let result = manager.register_handler(&RoutingKey::global("echo")).await;
        assert!(matches!(result, Err(BrokerError::Disconnected)));
    }
}
