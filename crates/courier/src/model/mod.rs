//! Request/response data model and routing-key identity.

mod errors;
mod identity;
mod request;
mod response;
mod routing;

pub use self::errors::ModelError;
pub use self::identity::ClientIdentity;
pub use self::request::{
    CallRequest, CallRequestDto, Trace, TraceInfo, is_request_shaped, new_trace_id,
};
pub use self::response::{
    CallResponse, CallResponseDto, ResponseTrace, is_response_dto_shaped, is_response_shaped,
    status,
};
pub use self::routing::{DEFAULT_SCOPE, DEFAULT_VERSION, RoutingKey};
