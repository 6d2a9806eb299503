//! In-process handler registry.
//!
//! The registry maps each [`RoutingKey`] to at most one handler. Dispatch
//! applies, in order: the internal-only guard (403), `args` schema validation
//! (422), then the handler itself. Handler failures are normalized here so
//! nothing but a [`CallResponse`] ever leaves a dispatch.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use super::DISPATCH_TARGET;
use super::errors::{HandlerError, RegistrationError};
use super::handler::{Handler, HandlerRegistration};
use super::validator::ArgsValidator;
use crate::model::{CallRequest, CallResponse, RoutingKey};

/// One registered handler with its access rule and validator.
pub struct HandlerEntry {
    registration: HandlerRegistration,
    validator: Option<ArgsValidator>,
    handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HandlerEntry")
            .field("registration", &self.registration)
            .field("validated", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl HandlerEntry {
    /// Whether only internal callers may reach the handler.
    #[must_use]
    pub fn is_internal_only(&self) -> bool {
        self.registration.internal
    }

    /// Descriptor the handler was registered with.
    #[must_use]
    pub fn registration(&self) -> &HandlerRegistration {
        &self.registration
    }

    /// Runs the guard, the validator and the handler against `request`.
    pub async fn dispatch(&self, request: &CallRequest) -> CallResponse {
        if self.is_internal_only() && !request.trace().is_internal() {
            debug!(
                target: DISPATCH_TARGET,
                key = %request.routing_key(),
                trace_id = request.trace_id(),
                "rejecting external caller for internal handler"
            );
            return CallResponse::unauthorized(request);
        }

        if let Some(validator) = &self.validator {
            let failures = validator.failures(request.args());
            if !failures.is_empty() {
                debug!(
                    target: DISPATCH_TARGET,
                    key = %request.routing_key(),
                    ?failures,
                    "args validation failed"
                );
                return CallResponse::validation_failed(&failures, request);
            }
        }

        let outcome = AssertUnwindSafe(self.handler.call(request.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(HandlerError::Response(response))) => response,
            Ok(Err(HandlerError::Failure(failure))) => {
                error!(
                    target: DISPATCH_TARGET,
                    key = %request.routing_key(),
                    trace_id = request.trace_id(),
                    error = %failure,
                    "handler failed; returning 500"
                );
                CallResponse::internal_error(request)
            }
            Err(_) => {
                error!(
                    target: DISPATCH_TARGET,
                    key = %request.routing_key(),
                    trace_id = request.trace_id(),
                    "handler panicked; returning 500"
                );
                CallResponse::internal_error(request)
            }
        }
    }
}

/// Routing-key indexed handler table.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: HashMap<RoutingKey, Arc<HandlerEntry>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handler` under the key described by `registration`.
    ///
    /// An `args` schema is compiled eagerly. Registering a key twice replaces
    /// the earlier entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::MissingMethod`] for a blank method and
    /// [`RegistrationError::SchemaCompile`] when the schema does not compile;
    /// nothing is registered in either case.
    pub fn register<H>(
        &mut self,
        registration: HandlerRegistration,
        handler: H,
    ) -> Result<RoutingKey, RegistrationError>
    where
        H: Handler + 'static,
    {
        self.register_shared(registration, Arc::new(handler))
    }

    /// Same as [`HandlerRegistry::register`] for an already shared handler.
    ///
    /// # Errors
    ///
    /// See [`HandlerRegistry::register`].
    pub fn register_shared(
        &mut self,
        registration: HandlerRegistration,
        handler: Arc<dyn Handler>,
    ) -> Result<RoutingKey, RegistrationError> {
        if registration.method.trim().is_empty() {
            return Err(RegistrationError::MissingMethod);
        }
        let key = registration.routing_key();
        let validator = ArgsValidator::compile(&key, registration.args.as_ref())?;

        let entry = HandlerEntry {
            registration,
            validator,
            handler,
        };
        if self.entries.insert(key.clone(), Arc::new(entry)).is_some() {
            warn!(
                target: DISPATCH_TARGET,
                key = %key,
                "replacing previously registered handler"
            );
        } else {
            debug!(target: DISPATCH_TARGET, key = %key, "registered handler");
        }
        Ok(key)
    }

    /// Whether a handler is registered for exactly `key`.
    #[must_use]
    pub fn can_handle(&self, key: &RoutingKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Shared handle on the entry for `key`.
    #[must_use]
    pub fn entry(&self, key: &RoutingKey) -> Option<Arc<HandlerEntry>> {
        self.entries.get(key).cloned()
    }

    /// Dispatches `request` to its handler, or returns 501 when none exists.
    pub async fn dispatch(&self, request: &CallRequest) -> CallResponse {
        match self.entry(&request.routing_key()) {
            Some(entry) => entry.dispatch(request).await,
            None => CallResponse::not_implemented(request),
        }
    }

    /// Every registered key, sorted.
    #[must_use]
    pub fn registered_keys(&self) -> Vec<RoutingKey> {
        let mut keys: Vec<_> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Registered keys whose method contains `method`, sorted.
    #[must_use]
    pub fn similar_keys(&self, method: &str) -> Vec<RoutingKey> {
        let mut keys: Vec<_> = self
            .entries
            .keys()
            .filter(|key| key.method().contains(method))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
