//! Capability error model.

use thiserror::Error;

/// Result type returned by capability handlers.
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Failure reported by a capability handler (hashing, backups, conversion, email).
///
/// The rendered message travels back to the caller as opaque display text in an
/// `error` reply, so variants must never embed payload values that could carry
/// credentials.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// The validated payload was still unusable (e.g. a malformed hash string).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced resource does not exist (e.g. missing upload).
    #[error("not found: {0}")]
    NotFound(String),

    /// An external process or library failed (e.g. backup script exit status).
    #[error("external failure: {0}")]
    External(String),

    /// No handler is registered for a kind the queue accepts.
    #[error("no handler registered for kind '{0}'")]
    Unhandled(String),

    /// The handler task aborted before producing a result.
    #[error("handler aborted: {0}")]
    Aborted(String),
}

impl CapabilityError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::External(msg.into())
    }
}
