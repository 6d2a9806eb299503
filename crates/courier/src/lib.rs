//! RPC dispatch core.
//!
//! A call request names a handler by routing key (`scope::method::version`).
//! The [`CallOrchestrator`] answers it from the in-process handler registry
//! when it can, forwards it through a message broker to whichever process
//! registered the key when it cannot, and synthesizes a 501 when neither path
//! exists. Whatever happens on the way (validation failures, access checks,
//! handler errors, timeouts) comes back as one [`CallResponse`] shape.
//!
//! Embedding code usually works through [`RpcServer`]:
//!
//! ```no_run
//! use courier::{HandlerOutput, HandlerRegistration, InternalCaller, MemoryBroker, RpcServer};
//! use courier::model::CallRequest;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), courier::ServerError> {
//! let broker = MemoryBroker::new();
//! let server = RpcServer::builder("greeter")
//!     .transport(std::sync::Arc::new(broker.transport()))
//!     .build()?;
//! server
//!     .register(
//!         HandlerRegistration::new("hello"),
//!         |_: CallRequest, _: InternalCaller| async move {
//!             Ok::<_, courier::HandlerError>(HandlerOutput::Data(json!("hi")))
//!         },
//!     )
//!     .await?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The `courierd` binary wires the same pieces from configuration through
//! [`bootstrap`].

pub mod bootstrap;
pub mod broker;
pub mod deadline;
pub mod dispatch;
pub mod events;
mod health;
pub mod model;
pub mod orchestrator;
mod server;
pub mod telemetry;

pub use bootstrap::{
    AmqpConnector, BootstrapError, BrokerConnector, ConfigLoader, Daemon, StaticConfigLoader,
    SystemConfigLoader, bootstrap_with,
};
pub use broker::{
    AmqpTransport, BrokerError, BrokerTransport, ConnectionObserver, MemoryBroker, TopologyReplay,
};
pub use deadline::{DEFAULT_TIMEOUT, DeadlineError};
pub use dispatch::{HandlerError, HandlerOutput, HandlerRegistration, RegistrationError};
pub use events::{EventBus, RpcEvent, RpcEventTopic, Subscription};
pub use health::{HealthReporter, ServingSummary, StructuredHealthReporter};
pub use model::{CallRequest, CallRequestDto, CallResponse, CallResponseDto, RoutingKey};
pub use orchestrator::{CallOrchestrator, InternalCaller, LifecycleHooks, RpcHandler};
pub use server::{RpcServer, RpcServerBuilder, ServerError};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
