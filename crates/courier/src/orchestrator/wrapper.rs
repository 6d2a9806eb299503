//! Adapts user handlers to the registry contract.

use std::future::Future;
use std::sync::Weak;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ORCHESTRATOR_TARGET, OrchestratorInner};
use crate::dispatch::{Handler, HandlerError, HandlerOutput};
use crate::events::RpcEvent;
use crate::model::{CallRequest, CallRequestDto, CallResponse, ClientIdentity, RoutingKey, TraceInfo};

/// A handler as written by server code.
///
/// Closures of the shape `|request, caller| async move { … }` implement this
/// trait.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Serves `request`. `caller` issues nested calls on the same server.
    async fn handle(
        &self,
        request: CallRequest,
        caller: InternalCaller,
    ) -> Result<HandlerOutput, HandlerError>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(CallRequest, InternalCaller) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        request: CallRequest,
        caller: InternalCaller,
    ) -> Result<HandlerOutput, HandlerError> {
        (self)(request, caller).await
    }
}

/// Issues calls from inside a handler through the full request path.
#[derive(Clone)]
pub struct InternalCaller {
    orchestrator: Weak<OrchestratorInner>,
    identity: Option<ClientIdentity>,
    origin: RoutingKey,
}

impl std::fmt::Debug for InternalCaller {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InternalCaller")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl InternalCaller {
    /// Calls another handler as an internal caller.
    ///
    /// The identity of the request being served is forwarded unless `dto`
    /// carries its own.
    ///
    /// # Errors
    ///
    /// Unsuccessful responses come back as [`HandlerError::Response`] so `?`
    /// hands them straight to the outer caller. A DTO without a method is a
    /// [`HandlerError::Failure`].
    pub async fn call(&self, mut dto: CallRequestDto) -> Result<CallResponse, HandlerError> {
        if dto.identity.is_none() {
            dto.identity.clone_from(&self.identity);
        }
        let info = TraceInfo::internal(format!("RpcServer.call {}", self.origin));
        let request = CallRequest::from_dto(dto, info).map_err(HandlerError::failure)?;

        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Err(HandlerError::msg("server is no longer running"));
        };
        let response = orchestrator.manage_request(&request).await;
        if response.is_success() {
            Ok(response)
        } else {
            Err(HandlerError::Response(response))
        }
    }

    /// Key of the handler this caller belongs to.
    #[must_use]
    pub fn origin(&self) -> &RoutingKey {
        &self.origin
    }
}

/// Registry handler wrapping a user [`RpcHandler`].
pub(crate) struct WrappedHandler<H> {
    pub(crate) handler: H,
    pub(crate) orchestrator: Weak<OrchestratorInner>,
}

impl<H: RpcHandler> WrappedHandler<H> {
    fn caller_for(&self, request: &CallRequest) -> InternalCaller {
        InternalCaller {
            orchestrator: Weak::clone(&self.orchestrator),
            identity: request.identity().cloned(),
            origin: request.routing_key(),
        }
    }

    fn emit(&self, event: RpcEvent) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.events.emit(event);
        }
    }

    fn recover(&self, failure: &anyhow::Error, request: &CallRequest) -> CallResponse {
        self.orchestrator
            .upgrade()
            .and_then(|orchestrator| orchestrator.hooks.recover(failure, request))
            .unwrap_or_else(|| CallResponse::handler_issue(request))
    }
}

/// Binds handler output to `request`.
///
/// Full responses keep their outcome but are re-addressed to `request` so the
/// reply always correlates with the call being served.
pub(crate) fn normalize(output: HandlerOutput, request: &CallRequest) -> CallResponse {
    match output {
        HandlerOutput::Data(data) => CallResponse::ok(data, request),
        HandlerOutput::Dto(dto) => CallResponse::new(dto, request),
        HandlerOutput::Response(response) if response.trace_id() == request.trace_id() => response,
        HandlerOutput::Response(response) => response.rebind(request),
    }
}

#[async_trait]
impl<H: RpcHandler> Handler for WrappedHandler<H> {
    async fn call(&self, request: CallRequest) -> Result<CallResponse, HandlerError> {
        let caller = self.caller_for(&request);
        let outcome = self.handler.handle(request.clone(), caller).await;

        let (response, error) = match outcome {
            Ok(output) => {
                let response = normalize(output, &request);
                if response.is_success() {
                    self.emit(RpcEvent::HandlerCallSuccess {
                        request,
                        response: response.clone(),
                    });
                    return Ok(response);
                }
                let error = format!(
                    "handler returned {}: {}",
                    response.code(),
                    response.message().unwrap_or_default()
                );
                (response, error)
            }
            Err(HandlerError::Response(response)) => {
                let error = format!(
                    "handler raised {}: {}",
                    response.code(),
                    response.message().unwrap_or_default()
                );
                (response.rebind(&request), error)
            }
            Err(HandlerError::Failure(failure)) => {
                warn!(
                    target: ORCHESTRATOR_TARGET,
                    key = %request.routing_key(),
                    trace_id = request.trace_id(),
                    error = %failure,
                    "handler failed"
                );
                (self.recover(&failure, &request), format!("{failure:#}"))
            }
        };

        debug!(
            target: ORCHESTRATOR_TARGET,
            key = %request.routing_key(),
            code = response.code(),
            "handler produced a failure response"
        );
        self.emit(RpcEvent::HandlerError {
            error,
            request,
            response: Some(response.clone()),
        });
        Err(HandlerError::Response(response))
    }
}
