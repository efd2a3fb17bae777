//! Identifiers carried in broker message properties.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token pairing one request with its eventual reply.
///
/// Workers never interpret the token; they echo the exact string they received.
/// Callers generate fresh tokens with [`CorrelationId::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new token.
    ///
    /// Uses UUIDv7 (time-ordered), which keeps tokens unique per process and
    /// sortable in logs.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wrap a token received off the wire, byte-for-byte.
    pub fn from_wire(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CorrelationId> for String {
    fn from(value: CorrelationId) -> Self {
        value.0
    }
}

/// Channel-scoped delivery identifier used to acknowledge a delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
