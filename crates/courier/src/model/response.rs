//! The uniform call outcome.
//!
//! Every dispatch path (local handler, broker round-trip, synthesized
//! failure) ends in a [`CallResponse`]. A response is bound to the request
//! that produced it: its `trace.id` is always the request's trace id, which is
//! what the broker protocol correlates replies on.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::request::CallRequest;

/// Status codes used on responses. The semantics follow HTTP.
pub mod status {
    /// Handler completed successfully.
    pub const OK: u16 = 200;
    /// Internal-only handler reached by a non-internal request.
    pub const FORBIDDEN: u16 = 403;
    /// Arguments failed the handler's schema.
    pub const UNPROCESSABLE: u16 = 422;
    /// Handler failure, timeout, or transport error.
    pub const INTERNAL_ERROR: u16 = 500;
    /// No handler anywhere for the routing key.
    pub const NOT_IMPLEMENTED: u16 = 501;
}

/// Trace block carried on a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseTrace {
    /// Trace id of the originating request.
    pub id: String,
}

/// Response shape a handler may return: `{ code, data?, message?, success }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponseDto {
    /// Status code.
    pub code: u16,
    /// Whether the call succeeded.
    pub success: bool,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Explanation, expected on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Correlation value; the request's own value takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Value>,
}

impl CallResponseDto {
    /// Successful DTO carrying `data`.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            code: status::OK,
            success: true,
            data: Some(data),
            message: None,
            correlation_id: None,
        }
    }

    /// Failed DTO with a status code and explanation.
    pub fn failure(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            success: false,
            data: None,
            message: Some(message.into()),
            correlation_id: None,
        }
    }
}

/// Normalized outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    code: u16,
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Value>,
    trace: ResponseTrace,
}

impl CallResponse {
    /// Binds a DTO to the request it answers.
    ///
    /// The trace id is copied from the request. The correlation id is the
    /// request's when it has one, otherwise the DTO's.
    #[must_use]
    pub fn new(dto: CallResponseDto, request: &CallRequest) -> Self {
        Self {
            code: dto.code,
            success: dto.success,
            data: dto.data,
            message: dto.message,
            correlation_id: request.correlation_id().cloned().or(dto.correlation_id),
            trace: ResponseTrace {
                id: request.trace_id().to_owned(),
            },
        }
    }

    /// 200 response carrying `data`.
    #[must_use]
    pub fn ok(data: Value, request: &CallRequest) -> Self {
        Self::new(CallResponseDto::ok(data), request)
    }

    /// Failed response with the given code and explanation.
    pub fn failure(code: u16, message: impl Into<String>, request: &CallRequest) -> Self {
        Self::new(CallResponseDto::failure(code, message), request)
    }

    /// 403 for an internal-only handler reached from outside the mesh.
    #[must_use]
    pub fn unauthorized(request: &CallRequest) -> Self {
        Self::failure(
            status::FORBIDDEN,
            "caller is not authorized to access this RPC",
            request,
        )
    }

    /// 422 listing every schema failure, comma-joined.
    #[must_use]
    pub fn validation_failed(failures: &[String], request: &CallRequest) -> Self {
        Self::failure(
            status::UNPROCESSABLE,
            format!("\"args\" validation failed: {}", failures.join(", ")),
            request,
        )
    }

    /// 501 when neither a local handler nor a broker exists.
    #[must_use]
    pub fn not_implemented(request: &CallRequest) -> Self {
        Self::failure(
            status::NOT_IMPLEMENTED,
            format!(
                "No method handler found for scope={}, method={}, version={}. \
                 Trace info: caller={} internal={}",
                request.scope(),
                request.method(),
                request.version(),
                request.trace().caller(),
                request.trace().is_internal(),
            ),
            request,
        )
    }

    /// 501 when the broker could not route the request to any queue.
    #[must_use]
    pub fn no_route(request: &CallRequest) -> Self {
        Self::failure(
            status::NOT_IMPLEMENTED,
            "no registered handlers for RPC",
            request,
        )
    }

    /// Generic 500 that hides the underlying failure.
    #[must_use]
    pub fn internal_error(request: &CallRequest) -> Self {
        Self::failure(status::INTERNAL_ERROR, "internal server error", request)
    }

    /// 500 used when a wrapped handler fails without a usable response.
    #[must_use]
    pub fn handler_issue(request: &CallRequest) -> Self {
        Self::failure(status::INTERNAL_ERROR, "server handler issue", request)
    }

    /// 500 for a remote call whose reply never arrived.
    #[must_use]
    pub fn timed_out(request: &CallRequest) -> Self {
        Self::failure(
            status::INTERNAL_ERROR,
            "no response received (timed out)",
            request,
        )
    }

    /// 500 for a remote call that failed for any other reason.
    #[must_use]
    pub fn rpc_error(request: &CallRequest) -> Self {
        Self::failure(
            status::INTERNAL_ERROR,
            "there was an error processing RPC",
            request,
        )
    }

    /// Re-associates this outcome with another request, keeping code,
    /// success flag, data and message.
    #[must_use]
    pub fn rebind(self, request: &CallRequest) -> Self {
        let dto = self.into_dto();
        Self::new(dto, request)
    }

    /// Projection used by external transports: only `data`, or an empty
    /// object when there is none. Code, message and success do not survive.
    #[must_use]
    pub fn to_response_dto(&self) -> Value {
        self.data.clone().unwrap_or_else(|| json!({}))
    }

    /// Strips the trace, keeping the DTO fields.
    #[must_use]
    pub fn into_dto(self) -> CallResponseDto {
        CallResponseDto {
            code: self.code,
            success: self.success,
            data: self.data,
            message: self.message,
            correlation_id: self.correlation_id,
        }
    }

    /// Status code.
    #[must_use]
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Whether the call succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Payload.
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Explanation.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Correlation value.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&Value> {
        self.correlation_id.as_ref()
    }

    /// Trace id of the originating request.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace.id
    }
}

/// Structural check: an object with `code`, `success` and `trace`.
#[must_use]
pub fn is_response_shaped(value: &Value) -> bool {
    has_fields(value, &["code", "success", "trace"])
}

/// Structural check: an object with `code` and `success`.
#[must_use]
pub fn is_response_dto_shaped(value: &Value) -> bool {
    has_fields(value, &["code", "success"])
}

fn has_fields(value: &Value, fields: &[&str]) -> bool {
    value
        .as_object()
        .is_some_and(|object| fields.iter().all(|field| object.contains_key(*field)))
}
