//! The call request: one unit of work, built once per inbound call.
//!
//! Requests come from three places: gateways (via [`CallRequest::from_dto`]),
//! the broker channel (deserialized from the wire envelope), and nested
//! internal calls made by handlers. Once built a request is never mutated;
//! the builder-style `with_*` methods consume and return it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::errors::ModelError;
use super::identity::ClientIdentity;
use super::routing::{DEFAULT_SCOPE, DEFAULT_VERSION, RoutingKey};

/// Where a request came from and how to correlate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    caller: String,
    id: String,
    #[serde(default)]
    internal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
}

impl Trace {
    /// Trace for an externally sourced call with a fresh id.
    pub fn external(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            id: new_trace_id(),
            internal: false,
            ip_address: None,
        }
    }

    /// Trace for a call originating inside the process mesh.
    pub fn internal(caller: impl Into<String>) -> Self {
        Self {
            internal: true,
            ..Self::external(caller)
        }
    }

    /// Replaces the trace id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Human-readable origin, for example `"http gateway"`.
    #[must_use]
    pub fn caller(&self) -> &str {
        &self.caller
    }

    /// Correlation id threaded through to the response.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the call originated inside the process mesh.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Origin IP address for externally sourced calls.
    #[must_use]
    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }
}

/// Trace details a gateway (or internal caller) supplies alongside a DTO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceInfo {
    /// Origin description; required.
    pub caller: String,
    /// Set only for calls made from inside the mesh.
    pub internal: bool,
    /// Client address when the transport knows it.
    pub ip_address: Option<String>,
}

impl TraceInfo {
    /// Details for a request that entered through a gateway.
    pub fn external(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            internal: false,
            ip_address: None,
        }
    }

    /// Details for a request made from inside the mesh.
    pub fn internal(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            internal: true,
            ip_address: None,
        }
    }

    /// Attaches the client address.
    #[must_use]
    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }
}

/// Loosely-typed request as received from an external transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequestDto {
    /// Handler arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Alternative spelling of `args`, used when `args` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Opaque caller value echoed back on the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Value>,
    /// Caller identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ClientIdentity>,
    /// Caller id, merged into `identity.id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Method name; required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Scope; defaults to the global scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Version; defaults to the default version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl CallRequestDto {
    /// DTO addressing `method` in the global scope.
    pub fn method(method: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            ..Self::default()
        }
    }

    /// DTO addressing the given routing key.
    #[must_use]
    pub fn for_key(key: &RoutingKey) -> Self {
        Self {
            method: Some(key.method().to_owned()),
            scope: Some(key.scope().to_owned()),
            version: Some(key.version().to_owned()),
            ..Self::default()
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    /// Sets the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Value) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the identity.
    #[must_use]
    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// A typed, immutable call request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity: Option<ClientIdentity>,
    method: String,
    #[serde(default = "default_scope")]
    scope: String,
    #[serde(default = "default_version")]
    version: String,
    trace: Trace,
}

impl CallRequest {
    /// Builds a request for `key` with the given trace and no payload.
    #[must_use]
    pub fn new(key: RoutingKey, trace: Trace) -> Self {
        let (scope, method, version) = key.into_parts();
        Self {
            args: None,
            correlation_id: None,
            identity: None,
            method,
            scope,
            version,
            trace,
        }
    }

    /// Builds a request from a transport DTO.
    ///
    /// Scope and version fall back to their defaults. `args` falls back to
    /// `params`. The trace id reuses the correlation id when one is present
    /// and non-empty, otherwise a fresh id is generated. The DTO's `id` is
    /// merged into `identity.id` unless the identity already carries one.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MissingMethod`] when the DTO has no method and
    /// [`ModelError::MissingCaller`] when `info.caller` is empty.
    pub fn from_dto(dto: CallRequestDto, info: TraceInfo) -> Result<Self, ModelError> {
        let method = match dto.method {
            Some(method) if !method.trim().is_empty() => method,
            _ => return Err(ModelError::MissingMethod),
        };
        if info.caller.trim().is_empty() {
            return Err(ModelError::MissingCaller);
        }

        let key = RoutingKey::new(
            dto.scope.unwrap_or_default(),
            method,
            dto.version.unwrap_or_default(),
        );

        let mut identity = dto.identity.unwrap_or_default();
        if identity.id.is_none() {
            identity.id = dto.id;
        }

        let trace = Trace {
            caller: info.caller,
            id: trace_id_for(dto.correlation_id.as_ref()),
            internal: info.internal,
            ip_address: info.ip_address,
        };

        Ok(Self {
            args: dto.args.or(dto.params),
            correlation_id: dto.correlation_id,
            identity: (!identity.is_empty()).then_some(identity),
            ..Self::new(key, trace)
        })
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    /// Sets the caller identity.
    #[must_use]
    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Value) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Routing key this request addresses.
    #[must_use]
    pub fn routing_key(&self) -> RoutingKey {
        RoutingKey::new(self.scope.as_str(), self.method.as_str(), self.version.as_str())
    }

    /// Method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Scope name.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Handler arguments.
    #[must_use]
    pub fn args(&self) -> Option<&Value> {
        self.args.as_ref()
    }

    /// Caller-supplied correlation value.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&Value> {
        self.correlation_id.as_ref()
    }

    /// Caller identity.
    #[must_use]
    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    /// Trace details.
    #[must_use]
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Shorthand for `trace().id()`.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        self.trace.id()
    }
}

/// Structural check used on untyped JSON: an object carrying `method`,
/// `scope`, `version` and `trace`.
#[must_use]
pub fn is_request_shaped(value: &Value) -> bool {
    value.as_object().is_some_and(|object| {
        ["method", "scope", "version", "trace"]
            .iter()
            .all(|field| object.contains_key(*field))
    })
}

/// Fresh unique trace id.
#[must_use]
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn trace_id_for(correlation_id: Option<&Value>) -> String {
    match correlation_id {
        None | Some(Value::Null | Value::Bool(false)) => new_trace_id(),
        Some(Value::String(text)) if text.is_empty() => new_trace_id(),
        Some(Value::Number(number)) if number.as_f64() == Some(0.0) => new_trace_id(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_owned()
}

fn default_version() -> String {
    DEFAULT_VERSION.to_owned()
}
