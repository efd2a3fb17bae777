//! Request/reply over the broker.

mod client;
mod pending;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use courier_messaging::BrokerError;

use crate::connection::ConnectionError;

pub use client::{RpcClient, shape_payload};

/// How replies find their way back to the caller.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ReplyMode {
    /// One exclusive reply queue per client; replies are routed by correlation id.
    #[default]
    Shared,
    /// A private, auto-expiring reply queue for every call.
    PerCall,
}

impl fmt::Display for ReplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyMode::Shared => f.write_str("shared"),
            ReplyMode::PerCall => f.write_str("per-call"),
        }
    }
}

impl FromStr for ReplyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(ReplyMode::Shared),
            "per-call" => Ok(ReplyMode::PerCall),
            other => Err(format!("unknown reply mode '{other}' (expected shared or per-call)")),
        }
    }
}

/// Why a call did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("reply consumer stopped before a reply arrived")]
    ReplyChannelLost,

    #[error("call to queue '{queue}' timed out after {}ms", ttl.as_millis())]
    Timeout { queue: String, ttl: Duration },

    /// The worker answered with an `error` reply.
    #[error("{0}")]
    Remote(String),

    #[error("malformed reply: {0}")]
    MalformedReply(String),
}

impl CallError {
    /// Transport-level failure (as opposed to a timeout or a worker answer).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CallError::Connection(_) | CallError::Broker(_) | CallError::ReplyChannelLost
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }
}
