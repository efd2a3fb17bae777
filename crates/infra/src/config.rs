//! Environment-driven configuration.

use std::str::FromStr;
use std::time::Duration;

use courier_messaging::DEFAULT_MAX_ENVELOPE_BYTES;

use crate::connection::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, RetryPolicy};
use crate::rpc::ReplyMode;

pub const DEFAULT_BROKER_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Settings shared by every courier process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierConfig {
    pub broker_url: String,
    pub retry: RetryPolicy,
    pub max_envelope_bytes: usize,
    pub reply_mode: ReplyMode,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            retry: RetryPolicy::default(),
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            reply_mode: ReplyMode::default(),
        }
    }
}

impl CourierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source (the process environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let broker_url = lookup("COURIER_BROKER_URL")
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());

        let max_attempts = parse_var(&lookup, "COURIER_CONNECT_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let delay_ms = parse_var(
            &lookup,
            "COURIER_CONNECT_RETRY_DELAY_MS",
            DEFAULT_RETRY_DELAY.as_millis() as u64,
        )?;
        let max_envelope_bytes =
            parse_var(&lookup, "COURIER_MAX_ENVELOPE_BYTES", DEFAULT_MAX_ENVELOPE_BYTES)?;
        if max_envelope_bytes == 0 {
            return Err(ConfigError::Invalid {
                var: "COURIER_MAX_ENVELOPE_BYTES",
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let reply_mode = parse_var(&lookup, "COURIER_REPLY_MODE", ReplyMode::default())?;

        Ok(Self {
            broker_url,
            retry: RetryPolicy::new(max_attempts, Duration::from_millis(delay_ms)),
            max_envelope_bytes,
            reply_mode,
        })
    }
}

/// Parse an optional variable, falling back to `default` when unset or blank.
pub fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}
