//! Handler contracts and the registration descriptor.

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::HandlerError;
use crate::model::{
    CallRequest, CallResponse, CallResponseDto, DEFAULT_SCOPE, DEFAULT_VERSION, RoutingKey,
    is_response_dto_shaped,
};

/// A handler stored in the registry.
///
/// Registry handlers already speak in [`CallResponse`]s. User-facing handlers
/// are adapted to this trait by the orchestrator, which adds output
/// normalization, lifecycle events and the internal caller.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Executes the call.
    async fn call(&self, request: CallRequest) -> Result<CallResponse, HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(CallRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallResponse, HandlerError>> + Send + 'static,
{
    async fn call(&self, request: CallRequest) -> Result<CallResponse, HandlerError> {
        (self)(request).await
    }
}

/// What a user handler may return.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    /// Bare payload, reported as a 200 success.
    Data(Value),
    /// A response already bound to a request.
    Response(CallResponse),
    /// A response shape to bind to the current request.
    Dto(CallResponseDto),
}

impl HandlerOutput {
    /// Reads a loosely-typed value: objects shaped like a response DTO are
    /// taken as one, anything else is data.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        if is_response_dto_shaped(&value) {
            if let Ok(dto) = CallResponseDto::deserialize(&value) {
                return Self::Dto(dto);
            }
        }
        Self::Data(value)
    }
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

impl From<CallResponse> for HandlerOutput {
    fn from(response: CallResponse) -> Self {
        Self::Response(response)
    }
}

impl From<CallResponseDto> for HandlerOutput {
    fn from(dto: CallResponseDto) -> Self {
        Self::Dto(dto)
    }
}

/// Describes a handler at registration time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRegistration {
    /// Method name.
    pub method: String,
    /// Scope; blank means the global scope.
    #[serde(default)]
    pub scope: String,
    /// Version; blank means the default version.
    #[serde(default)]
    pub version: String,
    /// Reject calls whose trace is not internal.
    #[serde(default)]
    pub internal: bool,
    /// JSON Schema for `args`. Only objects with a `type` member are compiled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Schema of the returned data. Documentation only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Identity requirement. Documentation only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
}

impl HandlerRegistration {
    /// Public handler for `method` in the global scope.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            scope: DEFAULT_SCOPE.to_owned(),
            version: DEFAULT_VERSION.to_owned(),
            ..Self::default()
        }
    }

    /// Sets the scope.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Restricts the handler to internal callers.
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Attaches an `args` schema.
    #[must_use]
    pub fn args_schema(mut self, schema: Value) -> Self {
        self.args = Some(schema);
        self
    }

    /// Attaches a description.
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Key the handler is registered under.
    #[must_use]
    pub fn routing_key(&self) -> RoutingKey {
        RoutingKey::new(self.scope.as_str(), self.method.as_str(), self.version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn dto_shaped_values_become_dtos() {
        let output = HandlerOutput::from(json!({"code": 404, "success": false, "message": "gone"}));
        assert_eq!(
            output,
            HandlerOutput::Dto(CallResponseDto::failure(404, "gone"))
        );
    }

    #[test]
    fn other_values_are_data() {
        let output = HandlerOutput::from(json!({"code": "not a number", "success": true}));
        assert!(matches!(output, HandlerOutput::Data(_)));
    }

    #[test]
    fn registration_defaults_to_global_scope() {
        let registration = HandlerRegistration::new("echo");
        assert_eq!(registration.routing_key(), RoutingKey::global("echo"));
        assert!(!registration.internal);
    }

    #[test]
    fn blank_scope_falls_back_in_key() {
        let registration = HandlerRegistration::new("echo").scope("").version("3");
        assert_eq!(registration.routing_key().to_string(), "global::echo::3");
    }
}
