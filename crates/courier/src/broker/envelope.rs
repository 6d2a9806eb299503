//! Wire envelope for broker messages: `{ "request": …, "response"?: … }`.

use serde::{Deserialize, Serialize};

use super::errors::BrokerError;
use crate::model::{CallRequest, CallResponse};

/// Body of every message on the RPC queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The call.
    pub request: CallRequest,
    /// Present on replies only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CallResponse>,
}

impl Envelope {
    /// Envelope carrying a request.
    #[must_use]
    pub fn request(request: CallRequest) -> Self {
        Self {
            request,
            response: None,
        }
    }

    /// Envelope carrying a reply together with its request.
    #[must_use]
    pub fn reply(request: CallRequest, response: CallResponse) -> Self {
        Self {
            request,
            response: Some(response),
        }
    }

    /// Serializes to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Envelope`] when serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Envelope`] for malformed bodies or bodies
    /// without a `request`.
    pub fn decode(body: &[u8]) -> Result<Self, BrokerError> {
        Ok(serde_json::from_slice(body)?)
    }
}
