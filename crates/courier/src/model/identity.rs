//! Who is calling, as far as the gateway could tell.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller identity carried on a request: credentials, device, free-form
/// metadata and an optional id.
///
/// The core never enforces anything about identity; it only threads it
/// through so handlers and nested internal calls can see who is calling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    /// Authorization token as supplied by the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    /// Device name reported by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Arbitrary client metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Caller id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ClientIdentity {
    /// Identity carrying only an authorization token.
    pub fn with_authorization(token: impl Into<String>) -> Self {
        Self {
            authorization: Some(token.into()),
            ..Self::default()
        }
    }

    /// True when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authorization.is_none()
            && self.device_name.is_none()
            && self.metadata.is_none()
            && self.id.is_none()
    }
}
