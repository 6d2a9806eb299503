//! Request/reply RPC over a [`BrokerTransport`].
//!
//! Each process owns one exclusive queue. Outgoing requests are published to
//! the scope-selected exchange with the routing key as binding key and the
//! queue name in `replyTo`; the caller then waits on a deadline-bound promise
//! filed under the request's trace id. The same queue receives both inbound
//! requests (bound by routing key) and replies (addressed by name); the
//! consumer tells them apart by the `type` property.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::BROKER_TARGET;
use super::envelope::Envelope;
use super::errors::BrokerError;
use super::transport::{
    BrokerTransport, Delivery, DeliveryReceiver, MessageKind, MessageProperties, PublishOutcome,
    exchange_for,
};
use crate::deadline::{self, DeadlineError, Settler};
use crate::events::{EventBus, RpcEvent};
use crate::model::{CallRequest, CallResponse, RoutingKey};

/// Serves requests taken off the process queue.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Produces the response for an inbound request.
    async fn handle_inbound(&self, request: CallRequest) -> CallResponse;
}

/// Builds the per-process queue name: `<display name>-rpc-<unique id>`.
#[must_use]
pub fn queue_name(display_name: &str) -> String {
    format!("{display_name}-rpc-{}", Uuid::new_v4().simple())
}

struct PendingCall {
    token: u64,
    settler: Settler<CallResponse, BrokerError>,
}

struct ChannelInner {
    transport: Arc<dyn BrokerTransport>,
    app_id: String,
    queue: String,
    timeout: Duration,
    pending: Mutex<HashMap<String, PendingCall>>,
    next_token: AtomicU64,
    events: EventBus<RpcEvent>,
}

impl ChannelInner {
    fn settle_reply(&self, delivery: &Delivery) {
        let envelope = match Envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(target: BROKER_TARGET, error = %error, "dropping unreadable reply");
                return;
            }
        };
        let Some(response) = envelope.response else {
            warn!(
                target: BROKER_TARGET,
                trace_id = envelope.request.trace_id(),
                "dropping reply without a response"
            );
            return;
        };
        let pending = self.pending.lock().remove(response.trace_id());
        match pending {
            Some(call) => {
                call.settler.resolve(response);
            }
            None => debug!(
                target: BROKER_TARGET,
                trace_id = response.trace_id(),
                "dropping late or unknown reply"
            ),
        }
    }

    fn reply_properties(&self, request: &CallRequest) -> MessageProperties {
        MessageProperties::new(MessageKind::Response, self.app_id.as_str(), request.trace_id())
    }
}

// Removes the pending entry on every exit path, including cancellation.
struct PendingGuard<'a> {
    inner: &'a ChannelInner,
    trace_id: String,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock();
        if pending
            .get(&self.trace_id)
            .is_some_and(|call| call.token == self.token)
        {
            pending.remove(&self.trace_id);
        }
    }
}

/// One process's RPC endpoint on the broker.
pub struct RpcChannel {
    inner: Arc<ChannelInner>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RpcChannel")
            .field("queue", &self.inner.queue)
            .field("pending", &self.inner.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl RpcChannel {
    /// Declares the process queue, starts consuming it and returns the
    /// channel.
    ///
    /// `handler` serves inbound requests; it is held weakly so the channel
    /// never keeps its owner alive.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from queue declaration or consumption.
    pub async fn open(
        transport: Arc<dyn BrokerTransport>,
        display_name: &str,
        timeout: Duration,
        events: EventBus<RpcEvent>,
        handler: Weak<dyn InboundHandler>,
    ) -> Result<Self, BrokerError> {
        let queue = queue_name(display_name);
        transport.declare_queue(&queue).await?;
        let deliveries = transport.consume(&queue).await?;
        debug!(target: BROKER_TARGET, queue = %queue, "rpc queue ready");

        let inner = Arc::new(ChannelInner {
            transport,
            app_id: display_name.to_owned(),
            queue,
            timeout,
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            events,
        });
        let consumer = tokio::spawn(consume(Arc::downgrade(&inner), deliveries, handler));
        Ok(Self {
            inner,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Name of this process's queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Binds the process queue so requests for `key` are delivered here.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn subscribe(&self, key: &RoutingKey) -> Result<(), BrokerError> {
        self.inner
            .transport
            .bind(&self.inner.queue, exchange_for(key), &key.to_string())
            .await?;
        debug!(target: BROKER_TARGET, key = %key, "bound routing key");
        Ok(())
    }

    /// Publishes `request` and waits for the correlated reply.
    ///
    /// Never fails: an unroutable request yields 501, a missing reply 500
    /// `no response received (timed out)` and any other failure 500
    /// `there was an error processing RPC`. The deadline covers publishing as
    /// well as waiting for the reply.
    pub async fn send_request(&self, request: &CallRequest) -> CallResponse {
        let inner = &*self.inner;
        let trace_id = request.trace_id().to_owned();
        let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (settler, waiter) = deadline::pair(inner.timeout);
        inner
            .pending
            .lock()
            .insert(trace_id.clone(), PendingCall { token, settler });
        let _guard = PendingGuard {
            inner,
            trace_id,
            token,
        };

        let published =
            tokio::time::timeout_at(waiter.deadline(), self.publish_request(request)).await;
        let Ok(published) = published else {
            warn!(
                target: BROKER_TARGET,
                key = %request.routing_key(),
                trace_id = request.trace_id(),
                timeout_ms = waiter.timeout().as_millis(),
                "publish did not complete before deadline"
            );
            return CallResponse::timed_out(request);
        };
        match published {
            Ok(PublishOutcome::Routed) => {}
            Ok(PublishOutcome::Returned) => {
                debug!(
                    target: BROKER_TARGET,
                    key = %request.routing_key(),
                    trace_id = request.trace_id(),
                    "request returned unroutable"
                );
                return CallResponse::no_route(request);
            }
            Err(error) => {
                warn!(
                    target: BROKER_TARGET,
                    key = %request.routing_key(),
                    error = %error,
                    "failed to publish request"
                );
                return CallResponse::rpc_error(request);
            }
        }

        match waiter.wait().await {
            Ok(response) => response,
            Err(DeadlineError::TimedOut(elapsed)) => {
                warn!(
                    target: BROKER_TARGET,
                    key = %request.routing_key(),
                    trace_id = request.trace_id(),
                    timeout_ms = elapsed.as_millis(),
                    "no reply before deadline"
                );
                CallResponse::timed_out(request)
            }
            Err(DeadlineError::Rejected(error)) => {
                warn!(target: BROKER_TARGET, error = %error, "remote call rejected");
                CallResponse::rpc_error(request)
            }
            Err(DeadlineError::Abandoned) => CallResponse::rpc_error(request),
        }
    }

    async fn publish_request(&self, request: &CallRequest) -> Result<PublishOutcome, BrokerError> {
        let inner = &self.inner;
        let body = Envelope::request(request.clone()).encode()?;
        let key = request.routing_key();
        let properties =
            MessageProperties::new(MessageKind::Request, inner.app_id.as_str(), request.trace_id())
                .with_reply_to(inner.queue.as_str());
        inner
            .transport
            .publish(exchange_for(&key), &key.to_string(), body, properties)
            .await
    }

    /// Stops consuming, fails every pending call and closes the transport.
    ///
    /// # Errors
    ///
    /// Propagates the transport's close error.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if let Some(consumer) = self.consumer.lock().take() {
            consumer.abort();
        }
        let pending: Vec<_> = self.inner.pending.lock().drain().collect();
        for (_, call) in pending {
            call.settler.reject(BrokerError::Closed);
        }
        self.inner.transport.close().await
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.get_mut().take() {
            consumer.abort();
        }
    }
}

async fn consume(
    inner: Weak<ChannelInner>,
    mut deliveries: DeliveryReceiver,
    handler: Weak<dyn InboundHandler>,
) {
    while let Some(delivery) = deliveries.recv().await {
        let Some(channel) = inner.upgrade() else {
            return;
        };
        match delivery.properties.message_kind() {
            Some(MessageKind::Response) => channel.settle_reply(&delivery),
            Some(MessageKind::Request) => {
                tokio::spawn(serve_request(channel, Weak::clone(&handler), delivery));
            }
            None => warn!(
                target: BROKER_TARGET,
                kind = ?delivery.properties.kind,
                "dropping message with unrecognized type"
            ),
        }
    }
}

async fn serve_request(
    channel: Arc<ChannelInner>,
    handler: Weak<dyn InboundHandler>,
    delivery: Delivery,
) {
    let request = match Envelope::decode(&delivery.body) {
        Ok(envelope) => envelope.request,
        Err(error) => {
            warn!(target: BROKER_TARGET, error = %error, "dropping unreadable request");
            return;
        }
    };
    let Some(reply_to) = delivery.properties.reply_to else {
        warn!(
            target: BROKER_TARGET,
            trace_id = request.trace_id(),
            "dropping request without replyTo"
        );
        return;
    };
    let Some(handler) = handler.upgrade() else {
        debug!(target: BROKER_TARGET, "server gone; dropping inbound request");
        return;
    };

    let outcome = AssertUnwindSafe(handler.handle_inbound(request.clone()))
        .catch_unwind()
        .await;
    let response = match outcome {
        Ok(response) => response,
        Err(_) => {
            error!(
                target: BROKER_TARGET,
                key = %request.routing_key(),
                trace_id = request.trace_id(),
                "inbound request handling panicked"
            );
            channel.events.emit(RpcEvent::RpcServerError {
                error: "request handling panicked".to_owned(),
                request: request.clone(),
            });
            CallResponse::internal_error(&request)
        }
    };
    send_reply(&channel, &reply_to, request, response).await;
}

async fn send_reply(
    channel: &ChannelInner,
    reply_to: &str,
    request: CallRequest,
    response: CallResponse,
) {
    let properties = channel.reply_properties(&request);
    let sent = match Envelope::reply(request.clone(), response).encode() {
        Ok(body) => {
            channel
                .transport
                .send_to_queue(reply_to, body, properties)
                .await
        }
        Err(error) => Err(error),
    };
    if let Err(error) = sent {
        warn!(
            target: BROKER_TARGET,
            reply_to,
            error = %error,
            "failed to send reply"
        );
        channel.events.emit(RpcEvent::RpcServerError {
            error: error.to_string(),
            request,
        });
    }
}
