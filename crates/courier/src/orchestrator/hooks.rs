//! Lifecycle callbacks around every managed request.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, error};

use super::ORCHESTRATOR_TARGET;
use crate::dispatch::HandlerOutput;
use crate::model::{CallRequest, CallResponse};

/// Value captured by the start hook and handed to the end hook.
pub type HookValue = Box<dyn Any + Send>;

type StartHook = Arc<dyn Fn(&CallRequest) -> Option<HookValue> + Send + Sync>;
type EndHook = Arc<dyn Fn(&CallRequest, Option<HookValue>) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&anyhow::Error, &CallRequest) -> Option<HandlerOutput> + Send + Sync>;

/// Optional callbacks applied uniformly to local, remote and unroutable
/// requests.
///
/// ```
/// use std::time::Instant;
///
/// use courier::LifecycleHooks;
///
/// let hooks = LifecycleHooks::new()
///     .on_start(|_request| Some(Box::new(Instant::now())))
///     .on_end(|request, started| {
///         if let Some(started) = started.and_then(|value| value.downcast::<Instant>().ok()) {
///             println!("{} took {:?}", request.routing_key(), started.elapsed());
///         }
///     });
/// # let _ = hooks;
/// ```
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    start: Option<StartHook>,
    end: Option<EndHook>,
    error: Option<ErrorHook>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LifecycleHooks")
            .field("start", &self.start.is_some())
            .field("end", &self.end.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

impl LifecycleHooks {
    /// No hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs before a request is dispatched. The returned value reaches the
    /// end hook for the same request.
    #[must_use]
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallRequest) -> Option<HookValue> + Send + Sync + 'static,
    {
        self.start = Some(Arc::new(hook));
        self
    }

    /// Runs once the response for a request is known, on every path.
    #[must_use]
    pub fn on_end<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallRequest, Option<HookValue>) + Send + Sync + 'static,
    {
        self.end = Some(Arc::new(hook));
        self
    }

    /// Runs when a handler fails opaquely. Returning a response or response
    /// DTO replaces the generic 500.
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error, &CallRequest) -> Option<HandlerOutput> + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(hook));
        self
    }

    pub(crate) fn start(&self, request: &CallRequest) -> Option<HookValue> {
        let hook = self.start.as_ref()?;
        catch_unwind(AssertUnwindSafe(|| hook(request))).unwrap_or_else(|_| {
            error!(
                target: ORCHESTRATOR_TARGET,
                key = %request.routing_key(),
                "start hook panicked"
            );
            None
        })
    }

    pub(crate) fn end(&self, request: &CallRequest, value: Option<HookValue>) {
        let Some(hook) = self.end.as_ref() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| hook(request, value))).is_err() {
            error!(
                target: ORCHESTRATOR_TARGET,
                key = %request.routing_key(),
                "end hook panicked"
            );
        }
    }

    /// Response substituted for an opaque handler failure, if any.
    pub(crate) fn recover(&self, failure: &anyhow::Error, request: &CallRequest) -> Option<CallResponse> {
        let hook = self.error.as_ref()?;
        let substitute = match catch_unwind(AssertUnwindSafe(|| hook(failure, request))) {
            Ok(substitute) => substitute?,
            Err(_) => {
                error!(
                    target: ORCHESTRATOR_TARGET,
                    key = %request.routing_key(),
                    "error hook panicked"
                );
                return None;
            }
        };
        match substitute {
            HandlerOutput::Response(response) => Some(response),
            HandlerOutput::Dto(dto) => Some(CallResponse::new(dto, request)),
            HandlerOutput::Data(_) => {
                debug!(
                    target: ORCHESTRATOR_TARGET,
                    key = %request.routing_key(),
                    "ignoring error hook result that is not a response"
                );
                None
            }
        }
    }
}

/// Pairs the end hook with a start hook, even if the request future is
/// dropped or unwinds.
pub(crate) struct HookScope<'a> {
    hooks: &'a LifecycleHooks,
    request: &'a CallRequest,
    value: Option<Option<HookValue>>,
}

impl<'a> HookScope<'a> {
    pub(crate) fn enter(hooks: &'a LifecycleHooks, request: &'a CallRequest) -> Self {
        let value = hooks.start(request);
        Self {
            hooks,
            request,
            value: Some(value),
        }
    }
}

impl Drop for HookScope<'_> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.hooks.end(self.request, value);
        }
    }
}
