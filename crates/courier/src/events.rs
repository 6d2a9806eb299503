//! Topic-keyed asynchronous publish/subscribe.
//!
//! Subscribers are async callbacks. Three delivery modes are offered:
//! [`EventBus::publish`] spawns every subscriber and returns immediately,
//! [`EventBus::publish_async`] awaits them concurrently and
//! [`EventBus::publish_sync`] awaits them one after another in subscription
//! order.
//!
//! A subscriber that panics is logged and skipped; the publisher and the
//! remaining subscribers carry on.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::RwLock;
use strum::{Display, EnumString, IntoStaticStr};
use tracing::warn;

use crate::model::{CallRequest, CallResponse};

const EVENTS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::events");

/// Topics published by the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RpcEventTopic {
    /// A wrapped handler completed successfully.
    HandlerCallSuccess,
    /// A wrapped handler failed.
    HandlerError,
    /// The broker channel could not answer an inbound request.
    RpcServerError,
}

impl RpcEventTopic {
    /// Topic name as used on the bus.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Payload published on the server's own topics.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    /// Published on [`RpcEventTopic::HandlerCallSuccess`].
    HandlerCallSuccess {
        /// Request the handler served.
        request: CallRequest,
        /// Successful response.
        response: CallResponse,
    },
    /// Published on [`RpcEventTopic::HandlerError`].
    HandlerError {
        /// Rendered failure.
        error: String,
        /// Request the handler was serving.
        request: CallRequest,
        /// Failed response, when one was produced.
        response: Option<CallResponse>,
    },
    /// Published on [`RpcEventTopic::RpcServerError`].
    RpcServerError {
        /// Rendered failure.
        error: String,
        /// Request that could not be answered.
        request: CallRequest,
    },
}

impl RpcEvent {
    /// Topic this event belongs to.
    #[must_use]
    pub fn topic(&self) -> RpcEventTopic {
        match self {
            Self::HandlerCallSuccess { .. } => RpcEventTopic::HandlerCallSuccess,
            Self::HandlerError { .. } => RpcEventTopic::HandlerError,
            Self::RpcServerError { .. } => RpcEventTopic::RpcServerError,
        }
    }
}

impl EventBus<RpcEvent> {
    /// Fire-and-forget publish on the event's own topic.
    pub fn emit(&self, event: RpcEvent) {
        let topic = event.topic();
        self.publish(topic.as_str(), event);
    }
}

type Subscriber<P> = Arc<dyn Fn(P) -> BoxFuture<'static, ()> + Send + Sync>;

struct BusInner<P> {
    topics: RwLock<HashMap<String, Vec<(u64, Subscriber<P>)>>>,
    next_id: AtomicU64,
}

/// Asynchronous event bus carrying payloads of type `P`.
pub struct EventBus<P> {
    inner: Arc<BusInner<P>>,
}

impl<P> Clone for EventBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> Default for EventBus<P> {
    fn default() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl<P> fmt::Debug for EventBus<P> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.inner.topics.read();
        formatter
            .debug_struct("EventBus")
            .field("topics", &topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<P> EventBus<P>
where
    P: Clone + Send + 'static,
{
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` to `topic` and returns a handle that removes it again.
    pub fn subscribe<F, Fut>(&self, topic: impl Into<String>, handler: F) -> Subscription<P>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::new(handler);
        let label = topic.clone();
        let subscriber: Subscriber<P> = Arc::new(move |payload: P| {
            let handler = Arc::clone(&handler);
            let topic = label.clone();
            async move {
                let run = AssertUnwindSafe(async move { (*handler)(payload).await });
                if run.catch_unwind().await.is_err() {
                    warn!(
                        target: EVENTS_TARGET,
                        topic = %topic,
                        subscription = id,
                        "event subscriber panicked"
                    );
                }
            }
            .boxed()
        });
        self.inner
            .topics
            .write()
            .entry(topic.clone())
            .or_default()
            .push((id, subscriber));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic,
            id,
        }
    }

    /// Fire-and-forget delivery: each subscriber runs on its own task.
    ///
    /// Outside a tokio runtime the event is dropped with a warning.
    pub fn publish(&self, topic: &str, payload: P) {
        let subscribers = self.subscribers(topic);
        if subscribers.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                target: EVENTS_TARGET,
                topic,
                "no runtime available; dropping event"
            );
            return;
        };
        for subscriber in subscribers {
            runtime.spawn(subscriber(payload.clone()));
        }
    }

    /// Runs every subscriber concurrently and waits for all of them.
    pub async fn publish_async(&self, topic: &str, payload: P) {
        let futures = self
            .subscribers(topic)
            .into_iter()
            .map(|subscriber| subscriber(payload.clone()));
        join_all(futures).await;
    }

    /// Runs subscribers one at a time in subscription order.
    pub async fn publish_sync(&self, topic: &str, payload: P) {
        for subscriber in self.subscribers(topic) {
            subscriber(payload.clone()).await;
        }
    }

    /// Number of handlers currently subscribed to `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }

    // Snapshot so no lock is held while subscribers run.
    fn subscribers(&self, topic: &str) -> Vec<Subscriber<P>> {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|entries| entries.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle leaves the subscription in place; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription<P> {
    bus: Weak<BusInner<P>>,
    topic: String,
    id: u64,
}

impl<P> fmt::Debug for Subscription<P> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

impl<P> Subscription<P> {
    /// Topic the handler is subscribed to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes exactly this handler. Returns `false` when it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut topics = bus.topics.write();
        let Some(entries) = topics.get_mut(&self.topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != self.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            topics.remove(&self.topic);
        }
        removed
    }
}
