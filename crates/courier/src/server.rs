//! The façade embedding code talks to.
//!
//! [`RpcServer`] owns a [`CallOrchestrator`] and an optional broker
//! transport. Handlers are registered before [`RpcServer::start`]; starting
//! opens the broker channel and subscribes every registered key, after which
//! the handler set is frozen.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_config::Config;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerError, BrokerManager, BrokerOptions, BrokerTransport};
use crate::deadline::DEFAULT_TIMEOUT;
use crate::dispatch::{HandlerRegistration, RegistrationError};
use crate::events::{EventBus, RpcEvent, RpcEventTopic, Subscription};
use crate::model::{CallRequest, CallRequestDto, CallResponse, ModelError, RoutingKey, TraceInfo};
use crate::orchestrator::{CallOrchestrator, LifecycleHooks, OrchestratorError, RpcHandler};

const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by [`RpcServer`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server was built without a display name.
    #[error("a display name is required")]
    MissingDisplayName,

    /// The operation is only allowed before the server starts.
    #[error("server has already been started")]
    AlreadyStarted,

    /// A handler registration was rejected.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The broker failed while starting, subscribing or stopping.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The topic is not one the server publishes.
    #[error("topic \"{topic}\" not recognized")]
    UnknownTopic {
        /// Rejected topic.
        topic: String,
    },

    /// [`RpcServer::call`] requires a caller description for the trace.
    #[error("call() requires a trace caller to track where the call originated")]
    MissingTraceCaller,

    /// The request DTO could not be turned into a request.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] ModelError),

    /// The call completed with an unsuccessful response.
    #[error("call failed with {}: {}", .0.code(), .0.message().unwrap_or_default())]
    Rejected(Box<CallResponse>),
}

impl From<OrchestratorError> for ServerError {
    fn from(error: OrchestratorError) -> Self {
        match error {
            OrchestratorError::Registration(source) => Self::Registration(source),
            OrchestratorError::Broker(source) => Self::Broker(source),
        }
    }
}

impl ServerError {
    /// Response carried by [`ServerError::Rejected`].
    #[must_use]
    pub fn response(&self) -> Option<&CallResponse> {
        match self {
            Self::Rejected(response) => Some(response),
            _ => None,
        }
    }
}

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    display_name: String,
    ephemeral_id: Option<String>,
    rpc_timeout: Duration,
    shutdown_timeout: Duration,
    hooks: LifecycleHooks,
    transport: Option<Arc<dyn BrokerTransport>>,
}

impl std::fmt::Debug for RpcServerBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RpcServerBuilder")
            .field("display_name", &self.display_name)
            .field("ephemeral_id", &self.ephemeral_id)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("hooks", &self.hooks)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

impl RpcServerBuilder {
    fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ephemeral_id: None,
            rpc_timeout: DEFAULT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            hooks: LifecycleHooks::default(),
            transport: None,
        }
    }

    /// Takes the name, instance id and timeouts from `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            ephemeral_id: config.ephemeral_id.clone(),
            rpc_timeout: config.rpc_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            ..Self::new(config.display_name())
        }
    }

    /// Fixes the instance id instead of generating one.
    #[must_use]
    pub fn ephemeral_id(mut self, id: impl Into<String>) -> Self {
        self.ephemeral_id = Some(id.into());
        self
    }

    /// Deadline for remote calls.
    #[must_use]
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Bound on broker teardown.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Lifecycle callbacks applied to every request.
    #[must_use]
    pub fn hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Broker used for the remote path. Without one the server is
    /// standalone.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn BrokerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the server.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::MissingDisplayName`] for a blank name.
    pub fn build(self) -> Result<RpcServer, ServerError> {
        let display_name = self.display_name.trim().to_owned();
        if display_name.is_empty() {
            return Err(ServerError::MissingDisplayName);
        }
        let ephemeral_id = self
            .ephemeral_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(
            target: SERVER_TARGET,
            display_name = %display_name,
            ephemeral_id = %ephemeral_id,
            "server created"
        );
        Ok(RpcServer {
            orchestrator: CallOrchestrator::new(self.hooks, EventBus::new()),
            display_name,
            ephemeral_id,
            rpc_timeout: self.rpc_timeout,
            shutdown_timeout: self.shutdown_timeout,
            transport: self.transport,
            started: AtomicBool::new(false),
        })
    }
}

/// An RPC server instance.
pub struct RpcServer {
    orchestrator: CallOrchestrator,
    display_name: String,
    ephemeral_id: String,
    rpc_timeout: Duration,
    shutdown_timeout: Duration,
    transport: Option<Arc<dyn BrokerTransport>>,
    started: AtomicBool,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RpcServer")
            .field("display_name", &self.display_name)
            .field("ephemeral_id", &self.ephemeral_id)
            .field("started", &self.is_started())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl RpcServer {
    /// Starts building a server named `display_name`.
    pub fn builder(display_name: impl Into<String>) -> RpcServerBuilder {
        RpcServerBuilder::new(display_name)
    }

    /// Display name of this server.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Unique id of this server instance.
    #[must_use]
    pub fn ephemeral_id(&self) -> &str {
        &self.ephemeral_id
    }

    /// Whether [`RpcServer::start`] has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The orchestrator serving this server's requests.
    #[must_use]
    pub fn orchestrator(&self) -> &CallOrchestrator {
        &self.orchestrator
    }

    /// Registers a handler.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyStarted`] once the server runs, or the
    /// registry's rejection of the descriptor.
    pub async fn register<H>(
        &self,
        registration: HandlerRegistration,
        handler: H,
    ) -> Result<RoutingKey, ServerError>
    where
        H: RpcHandler + 'static,
    {
        if self.is_started() {
            return Err(ServerError::AlreadyStarted);
        }
        Ok(self.orchestrator.register_handler(registration, handler).await?)
    }

    /// Opens the broker channel, when a transport is configured, and
    /// subscribes every registered key.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyStarted`] on a second call and
    /// [`ServerError::Broker`] when the channel cannot be set up. A failed
    /// start leaves the server unstarted, so it may be retried.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted);
        }
        let Some(transport) = self.transport.as_ref() else {
            info!(
                target: SERVER_TARGET,
                display_name = %self.display_name,
                handlers = self.orchestrator.registered_keys().len(),
                "no broker configured; running standalone"
            );
            return Ok(());
        };

        if let Err(error) = self.attach(Arc::clone(transport)).await {
            self.started.store(false, Ordering::Release);
            return Err(error);
        }
        info!(
            target: SERVER_TARGET,
            display_name = %self.display_name,
            handlers = self.orchestrator.registered_keys().len(),
            "server started"
        );
        Ok(())
    }

    // Leaves no broker attached when it fails.
    async fn attach(&self, transport: Arc<dyn BrokerTransport>) -> Result<(), ServerError> {
        let options = BrokerOptions {
            display_name: self.display_name.clone(),
            rpc_timeout: self.rpc_timeout,
            shutdown_timeout: self.shutdown_timeout,
        };
        let manager = Arc::new(
            BrokerManager::start(
                transport,
                options,
                self.orchestrator.events().clone(),
                self.orchestrator.inbound_handler(),
            )
            .await?,
        );
        let Err(error) = self.orchestrator.attach_broker(Arc::clone(&manager)).await else {
            return Ok(());
        };
        self.orchestrator.detach_broker();
        if let Err(shutdown) = manager.shutdown().await {
            warn!(
                target: SERVER_TARGET,
                error = %shutdown,
                "failed to release broker after a failed start"
            );
        }
        Err(error.into())
    }

    /// Detaches and shuts down the broker. Local handlers keep answering
    /// [`RpcServer::call`]; calling again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Broker`] when teardown fails or times out.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(broker) = self.orchestrator.detach_broker() else {
            return Ok(());
        };
        broker.shutdown().await?;
        info!(target: SERVER_TARGET, display_name = %self.display_name, "server stopped");
        Ok(())
    }

    /// Calls a handler from code embedding the server.
    ///
    /// The request is traced as internal with caller
    /// `RpcServer.call <trace_caller>`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::MissingTraceCaller`] for a blank
    /// `trace_caller`, [`ServerError::InvalidRequest`] for a DTO without a
    /// method, and [`ServerError::Rejected`] when the response is
    /// unsuccessful.
    pub async fn call(
        &self,
        dto: CallRequestDto,
        trace_caller: &str,
    ) -> Result<CallResponse, ServerError> {
        if trace_caller.trim().is_empty() {
            return Err(ServerError::MissingTraceCaller);
        }
        let info = TraceInfo::internal(format!("RpcServer.call {trace_caller}"));
        let request = CallRequest::from_dto(dto, info)?;
        let response = self.orchestrator.manage_request(&request).await;
        if response.is_success() {
            Ok(response)
        } else {
            Err(ServerError::Rejected(Box::new(response)))
        }
    }

    /// Entry point for gateways: answers `request` without failing.
    pub async fn manage_request(&self, request: &CallRequest) -> CallResponse {
        self.orchestrator.manage_request(request).await
    }

    /// Subscribes to one of the server's [`RpcEventTopic`]s.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownTopic`] for any other topic name.
    pub fn on<F, Fut>(&self, topic: &str, callback: F) -> Result<Subscription<RpcEvent>, ServerError>
    where
        F: Fn(RpcEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let topic: RpcEventTopic = topic.parse().map_err(|_| ServerError::UnknownTopic {
            topic: topic.to_owned(),
        })?;
        Ok(self.orchestrator.events().subscribe(topic.as_str(), callback))
    }

    /// Locally registered routing keys, sorted.
    #[must_use]
    pub fn registered_handlers(&self) -> Vec<RoutingKey> {
        self.orchestrator.registered_keys()
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use serde_json::json;

    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::broker::MockBrokerTransport;
    use crate::dispatch::{HandlerError, HandlerOutput};
    use crate::model::status;
    use crate::orchestrator::InternalCaller;

    #[fixture]
    fn server() -> RpcServer {
        RpcServer::builder("test-server").build().expect("build")
    }

    async fn ping(_: CallRequest, _: InternalCaller) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::Data(json!("pong")))
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn blank_display_name_is_rejected(#[case] name: &str) {
        assert!(matches!(
            RpcServer::builder(name).build(),
            Err(ServerError::MissingDisplayName)
        ));
    }

    #[test]
    fn ephemeral_id_is_generated_when_absent() {
        let first = RpcServer::builder("svc").build().expect("build");
        let second = RpcServer::builder("svc").build().expect("build");
        assert_ne!(first.ephemeral_id(), second.ephemeral_id());

        let fixed = RpcServer::builder("svc").ephemeral_id("abc").build().expect("build");
        assert_eq!(fixed.ephemeral_id(), "abc");
    }

    #[test]
    fn config_values_are_applied() {
        let config = Config {
            rpc_timeout_ms: 1_500,
            ephemeral_id: Some("from-config".to_owned()),
            ..Config::named(" svc ")
        };
        let server = RpcServerBuilder::from_config(&config).build().expect("build");
        assert_eq!(server.display_name(), "svc");
        assert_eq!(server.ephemeral_id(), "from-config");
        assert_eq!(server.rpc_timeout, Duration::from_millis(1_500));
    }

    fn consuming_transport() -> MockBrokerTransport {
        let mut transport = MockBrokerTransport::new();
        transport
            .expect_consume()
            .returning(|_| Ok(tokio::sync::mpsc::unbounded_channel().1));
        transport
    }

    #[tokio::test]
    async fn failed_start_can_be_retried() {
        let mut transport = consuming_transport();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&attempts);
        transport.expect_declare_queue().returning(move |_| {
            if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(BrokerError::Disconnected)
            } else {
                Ok(())
            }
        });
        transport.expect_bind().returning(|_, _, _| Ok(()));
        let server = RpcServer::builder("svc")
            .transport(Arc::new(transport))
            .build()
            .expect("build");

        assert!(matches!(
            server.start().await,
            Err(ServerError::Broker(BrokerError::Disconnected))
        ));
        assert!(!server.is_started());
        server
            .register(HandlerRegistration::new("ping"), ping)
            .await
            .expect("register after failed start");

        server.start().await.expect("second attempt");
        assert!(server.is_started());
        assert!(server.orchestrator().has_broker());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_subscription_releases_the_channel() {
        let mut transport = consuming_transport();
        transport.expect_declare_queue().returning(|_| Ok(()));
        transport
            .expect_bind()
            .returning(|_, _, _| Err(BrokerError::Disconnected));
        transport.expect_close().times(1).returning(|| Ok(()));
        let server = RpcServer::builder("svc")
            .transport(Arc::new(transport))
            .build()
            .expect("build");
        server
            .register(HandlerRegistration::new("ping"), ping)
            .await
            .expect("register");

        assert!(matches!(server.start().await, Err(ServerError::Broker(_))));
        assert!(!server.is_started());
        assert!(!server.orchestrator().has_broker());
        // Local dispatch is unaffected.
        let response = server
            .call(CallRequestDto::method("ping"), "tests")
            .await
            .expect("local call");
        assert_eq!(response.data(), Some(&json!("pong")));
    }

    #[rstest]
    #[tokio::test]
    async fn start_twice_fails(server: RpcServer) {
        server.start().await.expect("first start");
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));
    }

    #[rstest]
    #[tokio::test]
    async fn registration_is_closed_after_start(server: RpcServer) {
        server
            .register(HandlerRegistration::new("ping"), ping)
            .await
            .expect("register before start");
        server.start().await.expect("start");
        let late = server.register(HandlerRegistration::new("late"), ping).await;
        assert!(matches!(late, Err(ServerError::AlreadyStarted)));
        assert_eq!(server.registered_handlers(), vec![RoutingKey::global("ping")]);
    }

    #[rstest]
    #[tokio::test]
    async fn call_requires_trace_caller(server: RpcServer) {
        let result = server.call(CallRequestDto::method("ping"), " ").await;
        assert!(matches!(result, Err(ServerError::MissingTraceCaller)));
    }

    #[rstest]
    #[tokio::test]
    async fn call_returns_success_and_rejects_failure(server: RpcServer) {
        server
            .register(HandlerRegistration::new("ping"), ping)
            .await
            .expect("register");
        let response = server
            .call(CallRequestDto::method("ping"), "tests")
            .await
            .expect("ping succeeds");
        assert_eq!(response.data(), Some(&json!("pong")));

        let error = server
            .call(CallRequestDto::method("nope"), "tests")
            .await
            .expect_err("no handler");
        assert_eq!(
            error.response().map(CallResponse::code),
            Some(status::NOT_IMPLEMENTED)
        );
    }

    #[rstest]
    #[tokio::test]
    async fn internal_handlers_are_reachable_through_call(server: RpcServer) {
        server
            .register(HandlerRegistration::new("secret").internal(), ping)
            .await
            .expect("register");
        let response = server
            .call(CallRequestDto::method("secret"), "tests")
            .await
            .expect("internal call allowed");
        assert_eq!(response.code(), status::OK);
    }

    #[rstest]
    fn unknown_topics_are_rejected(server: RpcServer) {
        let result = server.on("connections", |_| async {});
        assert!(matches!(result, Err(ServerError::UnknownTopic { .. })));
        let subscription = server
            .on("handler_error", |_| async {})
            .expect("known topic");
        assert_eq!(subscription.topic(), "handler_error");
    }

    #[rstest]
    #[tokio::test]
    async fn stop_without_broker_is_a_no_op(server: RpcServer) {
        server.start().await.expect("start");
        server.stop().await.expect("stop");
        server.stop().await.expect("stop again");
    }
}
