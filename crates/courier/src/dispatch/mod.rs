//! Local handler dispatch.
//!
//! Handlers registered in this process live in a [`HandlerRegistry`] keyed by
//! routing key. The registry owns access control and argument validation; the
//! orchestrator decides whether a request is served here or forwarded to the
//! broker.

mod errors;
mod handler;
mod registry;
mod validator;

pub use errors::{HandlerError, RegistrationError};
pub use handler::{Handler, HandlerOutput, HandlerRegistration};
pub use registry::{HandlerEntry, HandlerRegistry};
pub use validator::ArgsValidator;

/// Tracing target for dispatch operations.
pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");
