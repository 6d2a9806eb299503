//! Chooses between local and remote execution for every request.
//!
//! The orchestrator owns the handler registry and, once the server starts,
//! the broker manager. A request whose routing key is registered locally is
//! dispatched in-process; otherwise it is forwarded through the broker when
//! one is attached, and answered with 501 when not. The lifecycle hooks wrap
//! all three paths identically.

mod hooks;
mod wrapper;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::broker::{BrokerError, BrokerManager, InboundHandler};
use crate::dispatch::{HandlerRegistration, HandlerRegistry, RegistrationError};
use crate::events::{EventBus, RpcEvent};
use crate::model::{CallRequest, CallResponse, RoutingKey};

pub use hooks::{HookValue, LifecycleHooks};
pub use wrapper::{InternalCaller, RpcHandler};

use hooks::HookScope;
use wrapper::WrappedHandler;

pub(crate) const ORCHESTRATOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::orchestrator");

/// Errors raised while registering a handler with the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The local registry rejected the handler.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    /// The broker could not bind the routing key.
    #[error("failed to subscribe handler on the broker: {0}")]
    Broker(#[from] BrokerError),
}

pub(crate) struct OrchestratorInner {
    registry: RwLock<HandlerRegistry>,
    broker: RwLock<Option<Arc<BrokerManager>>>,
    pub(crate) hooks: LifecycleHooks,
    pub(crate) events: EventBus<RpcEvent>,
}

impl OrchestratorInner {
    pub(crate) async fn manage_request(&self, request: &CallRequest) -> CallResponse {
        let entry = self.registry.read().entry(&request.routing_key());
        let _scope = HookScope::enter(&self.hooks, request);

        if let Some(entry) = entry {
            return entry.dispatch(request).await;
        }

        let broker = self.broker.read().clone();
        if let Some(broker) = broker {
            return broker.manage_request(request).await;
        }

        let similar = self.registry.read().similar_keys(request.method());
        debug!(
            target: ORCHESTRATOR_TARGET,
            key = %request.routing_key(),
            caller = request.trace().caller(),
            similar = ?similar.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "no handler for request"
        );
        CallResponse::not_implemented(request)
    }
}

#[async_trait]
impl InboundHandler for OrchestratorInner {
    async fn handle_inbound(&self, request: CallRequest) -> CallResponse {
        self.manage_request(&request).await
    }
}

/// Routes requests to local handlers or through the broker.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CallOrchestrator")
            .field("handlers", &self.inner.registry.read().len())
            .field("broker", &self.inner.broker.read().is_some())
            .field("hooks", &self.inner.hooks)
            .finish()
    }
}

impl Default for CallOrchestrator {
    fn default() -> Self {
        Self::new(LifecycleHooks::default(), EventBus::new())
    }
}

impl CallOrchestrator {
    /// Creates an orchestrator with no handlers and no broker.
    #[must_use]
    pub fn new(hooks: LifecycleHooks, events: EventBus<RpcEvent>) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                registry: RwLock::new(HandlerRegistry::new()),
                broker: RwLock::new(None),
                hooks,
                events,
            }),
        }
    }

    /// Produces the response for `request`. Never fails.
    pub async fn manage_request(&self, request: &CallRequest) -> CallResponse {
        self.inner.manage_request(request).await
    }

    /// Registers `handler` locally and, with a broker attached, subscribes
    /// its routing key on the broker.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Registration`] when the descriptor is
    /// rejected and [`OrchestratorError::Broker`] when binding fails. A
    /// binding failure leaves the local registration in place.
    pub async fn register_handler<H>(
        &self,
        registration: HandlerRegistration,
        handler: H,
    ) -> Result<RoutingKey, OrchestratorError>
    where
        H: RpcHandler + 'static,
    {
        let wrapped = WrappedHandler {
            handler,
            orchestrator: Arc::downgrade(&self.inner),
        };
        let key = self.inner.registry.write().register(registration, wrapped)?;
        let broker = self.inner.broker.read().clone();
        if let Some(broker) = broker {
            broker.register_handler(&key).await?;
        }
        Ok(key)
    }

    /// Makes `broker` the remote path and subscribes every registered key.
    ///
    /// # Errors
    ///
    /// Propagates the first binding failure.
    pub async fn attach_broker(&self, broker: Arc<BrokerManager>) -> Result<(), BrokerError> {
        *self.inner.broker.write() = Some(Arc::clone(&broker));
        let keys = self.registered_keys();
        for key in &keys {
            broker.register_handler(key).await?;
        }
        debug!(
            target: ORCHESTRATOR_TARGET,
            queue = broker.queue(),
            handlers = keys.len(),
            "broker attached"
        );
        Ok(())
    }

    /// Removes the remote path, returning the manager for shutdown.
    pub fn detach_broker(&self) -> Option<Arc<BrokerManager>> {
        self.inner.broker.write().take()
    }

    /// Queue of the attached broker, if any.
    #[must_use]
    pub fn broker_queue(&self) -> Option<String> {
        self.inner
            .broker
            .read()
            .as_ref()
            .map(|broker| broker.queue().to_owned())
    }

    /// Whether a broker is attached.
    #[must_use]
    pub fn has_broker(&self) -> bool {
        self.inner.broker.read().is_some()
    }

    /// Handler serving inbound broker requests; held weakly by the channel.
    #[must_use]
    pub fn inbound_handler(&self) -> Weak<dyn InboundHandler> {
        let weak: Weak<OrchestratorInner> = Arc::downgrade(&self.inner);
        weak
    }

    /// Whether `key` is registered locally.
    #[must_use]
    pub fn can_handle(&self, key: &RoutingKey) -> bool {
        self.inner.registry.read().can_handle(key)
    }

    /// Locally registered keys, sorted.
    #[must_use]
    pub fn registered_keys(&self) -> Vec<RoutingKey> {
        self.inner.registry.read().registered_keys()
    }

    /// The bus handler events are published on.
    #[must_use]
    pub fn events(&self) -> &EventBus<RpcEvent> {
        &self.inner.events
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use rstest::{fixture, rstest};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::dispatch::{HandlerError, HandlerOutput};
    use crate::events::RpcEventTopic;
    use crate::model::{
        CallRequestDto, CallResponseDto, ClientIdentity, Trace, TraceInfo, status,
    };

    #[fixture]
    fn orchestrator() -> CallOrchestrator {
        CallOrchestrator::default()
    }

    fn external(method: &str) -> CallRequest {
        CallRequest::new(RoutingKey::global(method), Trace::external("test"))
    }

    async fn echo(request: CallRequest, _: InternalCaller) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::Data(request.args().cloned().unwrap_or_default()))
    }

    #[rstest]
    #[tokio::test]
    async fn local_hit_runs_handler(orchestrator: CallOrchestrator) {
        orchestrator
            .register_handler(HandlerRegistration::new("echo"), echo)
            .await
            .expect("register");
        let request = external("echo").with_args(json!({"a": 1}));
        let response = orchestrator.manage_request(&request).await;
        assert_eq!(response.code(), status::OK);
        assert_eq!(response.data(), Some(&json!({"a": 1})));
    }

    #[rstest]
    #[tokio::test]
    async fn miss_without_broker_is_501(orchestrator: CallOrchestrator) {
        let response = orchestrator.manage_request(&external("missing")).await;
        assert_eq!(response.code(), status::NOT_IMPLEMENTED);
        let message = response.message().unwrap_or_default();
        assert!(message.starts_with("No method handler found for scope=global, method=missing"));
    }

    #[tokio::test]
    async fn hooks_pair_on_every_path() {
        let log = std::sync::Arc::new(Mutex::new(Vec::new()));
        let starts = std::sync::Arc::clone(&log);
        let ends = std::sync::Arc::clone(&log);
        let hooks = LifecycleHooks::new()
            .on_start(move |request| {
                starts.lock().expect("lock").push(format!("start {}", request.method()));
                Some(Box::new(request.method().to_owned()))
            })
            .on_end(move |_, value| {
                let method = value
                    .and_then(|boxed| boxed.downcast::<String>().ok())
                    .map_or_else(String::new, |boxed| *boxed);
                ends.lock().expect("lock").push(format!("end {method}"));
            });
        let orchestrator = CallOrchestrator::new(hooks, EventBus::new());
        orchestrator
            .register_handler(HandlerRegistration::new("echo"), echo)
            .await
            .expect("register");

        orchestrator.manage_request(&external("echo")).await;
        orchestrator.manage_request(&external("missing")).await;

        assert_eq!(
            *log.lock().expect("lock"),
            vec!["start echo", "end echo", "start missing", "end missing"]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn internal_caller_forwards_identity_and_marks_internal(orchestrator: CallOrchestrator) {
        orchestrator
            .register_handler(
                HandlerRegistration::new("whoami").internal(),
                |request: CallRequest, _: InternalCaller| async move {
                    Ok::<_, HandlerError>(HandlerOutput::Data(json!({
                        "caller": request.trace().caller(),
                        "token": request.identity().and_then(|identity| identity.authorization.clone()),
                    })))
                },
            )
            .await
            .expect("register whoami");
        orchestrator
            .register_handler(
                HandlerRegistration::new("outer"),
                |_: CallRequest, caller: InternalCaller| async move {
                    let inner = caller.call(CallRequestDto::method("whoami")).await?;
                    Ok::<_, HandlerError>(HandlerOutput::Data(
                        inner.data().cloned().unwrap_or_default(),
                    ))
                },
            )
            .await
            .expect("register outer");

        let request = external("outer").with_identity(ClientIdentity::with_authorization("tok"));
        let response = orchestrator.manage_request(&request).await;
        assert_eq!(response.code(), status::OK);
        assert_eq!(
            response.data(),
            Some(&json!({"caller": "RpcServer.call global::outer::1", "token": "tok"}))
        );

        let direct = orchestrator.manage_request(&external("whoami")).await;
        assert_eq!(direct.code(), status::FORBIDDEN);
    }

    #[rstest]
    #[tokio::test]
    async fn nested_failure_propagates_to_outer_request(orchestrator: CallOrchestrator) {
        orchestrator
            .register_handler(
                HandlerRegistration::new("outer"),
                |_: CallRequest, caller: InternalCaller| async move {
                    caller.call(CallRequestDto::method("absent")).await?;
                    Ok::<_, HandlerError>(HandlerOutput::Data(json!("unreachable")))
                },
            )
            .await
            .expect("register");
        let request = external("outer").with_correlation_id(json!(9));
        let response = orchestrator.manage_request(&request).await;
        assert_eq!(response.code(), status::NOT_IMPLEMENTED);
        assert_eq!(response.trace_id(), request.trace_id());
        assert_eq!(response.correlation_id(), Some(&json!(9)));
    }

    #[tokio::test]
    async fn error_hook_replaces_opaque_failure() {
        let hooks = LifecycleHooks::new().on_error(|error, _| {
            Some(CallResponseDto::failure(503, format!("unavailable: {error}")).into())
        });
        let orchestrator = CallOrchestrator::new(hooks, EventBus::new());
        orchestrator
            .register_handler(
                HandlerRegistration::new("flaky"),
                |_: CallRequest, _: InternalCaller| async move {
                    Err::<HandlerOutput, _>(HandlerError::msg("db down"))
                },
            )
            .await
            .expect("register");
        let response = orchestrator.manage_request(&external("flaky")).await;
        assert_eq!(response.code(), 503);
        assert_eq!(response.message(), Some("unavailable: db down"));
    }

    #[rstest]
    #[tokio::test]
    async fn opaque_failure_without_hook_is_generic(orchestrator: CallOrchestrator) {
        orchestrator
            .register_handler(
                HandlerRegistration::new("flaky"),
                |_: CallRequest, _: InternalCaller| async move {
                    Err::<HandlerOutput, _>(HandlerError::msg("secret detail"))
                },
            )
            .await
            .expect("register");
        let response = orchestrator.manage_request(&external("flaky")).await;
        assert_eq!(response.code(), status::INTERNAL_ERROR);
        assert_eq!(response.message(), Some("server handler issue"));
    }

    #[rstest]
    #[tokio::test]
    async fn events_report_success_and_failure(orchestrator: CallOrchestrator) {
        let (sender, mut received) = mpsc::unbounded_channel();
        for topic in [RpcEventTopic::HandlerCallSuccess, RpcEventTopic::HandlerError] {
            let sender = sender.clone();
            orchestrator.events().subscribe(topic.as_str(), move |event: RpcEvent| {
                let sender = sender.clone();
                async move {
                    sender.send(event.topic()).expect("test receiver alive");
                }
            });
        }
        orchestrator
            .register_handler(HandlerRegistration::new("echo"), echo)
            .await
            .expect("register echo");
        orchestrator
            .register_handler(
                HandlerRegistration::new("refuse"),
                |request: CallRequest, _: InternalCaller| async move {
                    Ok::<_, HandlerError>(HandlerOutput::Response(CallResponse::failure(
                        409, "conflict", &request,
                    )))
                },
            )
            .await
            .expect("register refuse");

        orchestrator.manage_request(&external("echo")).await;
        let refused = orchestrator.manage_request(&external("refuse")).await;
        assert_eq!(refused.code(), 409);

        let mut topics = Vec::new();
        for _ in 0..2 {
            let topic = tokio::time::timeout(Duration::from_secs(1), received.recv())
                .await
                .expect("event in time")
                .expect("event");
            topics.push(topic);
        }
        topics.sort_by_key(|topic| topic.as_str());
        assert_eq!(
            topics,
            vec![RpcEventTopic::HandlerCallSuccess, RpcEventTopic::HandlerError]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn from_dto_requests_route_like_typed_ones(orchestrator: CallOrchestrator) {
        orchestrator
            .register_handler(HandlerRegistration::new("echo").scope("tools").version("2"), echo)
            .await
            .expect("register");
        let dto = CallRequestDto::method("echo")
            .with_scope("tools")
            .with_version("2")
            .with_args(json!("hi"));
        let request = CallRequest::from_dto(dto, TraceInfo::external("http")).expect("request");
        let response = orchestrator.manage_request(&request).await;
        assert_eq!(response.to_response_dto(), json!("hi"));
        assert!(orchestrator.can_handle(&RoutingKey::new("tools", "echo", "2")));
    }
}
