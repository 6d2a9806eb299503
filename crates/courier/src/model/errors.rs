//! Errors raised while building requests from loosely-typed input.

use thiserror::Error;

/// A request DTO could not be turned into a [`CallRequest`].
///
/// These never reach dispatch: gateways report them to their client
/// directly.
///
/// [`CallRequest`]: super::CallRequest
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// The DTO carried no method, or an empty one.
    #[error("invalid request: method is required")]
    MissingMethod,

    /// The trace details carried no caller.
    #[error("invalid request: trace.caller is required")]
    MissingCaller,
}
