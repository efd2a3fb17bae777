//! Queue declaration parameters and call classes.

use std::time::Duration;

/// Timeout class for a call, tuned to the work it triggers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CallClass {
    /// Liveness checks and hashing.
    Short,
    /// Photo conversion.
    Medium,
    /// Backups.
    Long,
}

impl CallClass {
    pub fn ttl(self) -> Duration {
        match self {
            CallClass::Short => Duration::from_millis(1_500),
            CallClass::Medium => Duration::from_millis(5_000),
            CallClass::Long => Duration::from_millis(20_000),
        }
    }
}

/// Parameters used to declare a queue (idempotent on the broker side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Queue name; empty asks the broker to generate one.
    pub name: String,
    /// Definition survives broker restart.
    pub durable: bool,
    /// Usable by the declaring channel only; deleted when it closes.
    pub exclusive: bool,
    /// Per-queue message TTL.
    pub message_ttl: Option<Duration>,
    /// Queue is deleted after being unused for this long.
    pub expires: Option<Duration>,
}

impl QueueConfig {
    /// Addressable worker queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            message_ttl: None,
            expires: None,
        }
    }

    /// Private, broker-named reply destination owned by the declaring channel.
    pub fn exclusive_reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            message_ttl: None,
            expires: None,
        }
    }

    /// Private reply destination that also expires on its own after `ttl`.
    pub fn ephemeral_reply(ttl: Duration) -> Self {
        Self {
            message_ttl: Some(ttl),
            expires: Some(ttl),
            ..Self::exclusive_reply()
        }
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}
