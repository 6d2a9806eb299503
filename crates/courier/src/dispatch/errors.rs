//! Error types for handler registration and execution.

use std::fmt;

use thiserror::Error;

use crate::model::{CallResponse, RoutingKey};

/// Errors surfaced while registering a handler.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The `args` schema could not be compiled.
    #[error("unable to compile JSON-schema for \"{key}\": {message}")]
    SchemaCompile {
        /// Key the handler was being registered under.
        key: RoutingKey,
        /// Compiler diagnostic.
        message: String,
    },

    /// The registration descriptor carried no method.
    #[error("handler registration requires a method")]
    MissingMethod,
}

impl RegistrationError {
    /// Creates a schema compile error.
    pub fn schema_compile(key: RoutingKey, message: impl Into<String>) -> Self {
        Self::SchemaCompile {
            key,
            message: message.into(),
        }
    }
}

/// Failure returned by a handler.
///
/// [`HandlerError::Response`] is a deliberate, fully-formed outcome (for
/// example a 404 the handler chose to send) and is returned to the caller
/// unchanged. [`HandlerError::Failure`] is opaque and becomes a generic 500
/// without leaking its detail.
///
/// This type does not implement [`std::error::Error`] so that `?` can lift
/// both responses and ordinary errors into it.
pub enum HandlerError {
    /// A response to return as-is.
    Response(CallResponse),
    /// Any other failure.
    Failure(anyhow::Error),
}

impl HandlerError {
    /// Wraps an arbitrary error as an opaque failure.
    pub fn failure<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Failure(error.into())
    }

    /// Opaque failure carrying only a message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failure(anyhow::Error::msg(message))
    }

    /// The response for [`HandlerError::Response`].
    #[must_use]
    pub fn response(&self) -> Option<&CallResponse> {
        match self {
            Self::Response(response) => Some(response),
            Self::Failure(_) => None,
        }
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(response) => formatter.debug_tuple("Response").field(response).finish(),
            Self::Failure(error) => formatter.debug_tuple("Failure").field(error).finish(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(response) => write!(
                formatter,
                "handler returned {}: {}",
                response.code(),
                response.message().unwrap_or("no message")
            ),
            Self::Failure(error) => write!(formatter, "handler failed: {error:#}"),
        }
    }
}

impl From<CallResponse> for HandlerError {
    fn from(response: CallResponse) -> Self {
        Self::Response(response)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::Failure(error)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::Failure(error.into())
    }
}
