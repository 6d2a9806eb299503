//! Routing-key identity for handler slots.
//!
//! A routing key names exactly one handler slot in a process and doubles as
//! the binding key on the broker exchanges. Its textual form is
//! `scope::method::version`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scope applied when a request does not name one.
pub const DEFAULT_SCOPE: &str = "global";

/// Version applied when a request does not name one.
pub const DEFAULT_VERSION: &str = "1";

/// Value-typed `(scope, method, version)` triple.
///
/// Matching is exact on all three fields; there is no wildcard or prefix
/// matching anywhere in the dispatch path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawRoutingKey")]
pub struct RoutingKey {
    scope: String,
    method: String,
    version: String,
}

impl RoutingKey {
    /// Builds a key from its three parts. Empty scope or version fall back to
    /// [`DEFAULT_SCOPE`] and [`DEFAULT_VERSION`].
    pub fn new(
        scope: impl Into<String>,
        method: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            scope: or_default(scope.into(), DEFAULT_SCOPE),
            method: method.into(),
            version: or_default(version.into(), DEFAULT_VERSION),
        }
    }

    /// Key in the global scope with the default version.
    pub fn global(method: impl Into<String>) -> Self {
        Self::new(DEFAULT_SCOPE, method, DEFAULT_VERSION)
    }

    /// Scope component.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Method component.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Version component.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Splits the key into `(scope, method, version)`.
    #[must_use]
    pub fn into_parts(self) -> (String, String, String) {
        (self.scope, self.method, self.version)
    }

    /// Whether the key lives in the reserved global scope.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.scope == DEFAULT_SCOPE
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}::{}::{}", self.scope, self.method, self.version)
    }
}

// Wire form; decoding goes through `RoutingKey::new` for the defaults.
#[derive(Deserialize)]
struct RawRoutingKey {
    #[serde(default)]
    scope: String,
    method: String,
    #[serde(default)]
    version: String,
}

impl From<RawRoutingKey> for RoutingKey {
    fn from(raw: RawRoutingKey) -> Self {
        Self::new(raw.scope, raw.method, raw.version)
    }
}

fn or_default(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_owned()
    } else {
        value
    }
}
