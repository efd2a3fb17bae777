//! Password hashing service: Argon2id PHC strings.

use std::sync::Arc;

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use async_trait::async_trait;
use rand::{TryRngCore, rngs::OsRng};
use serde_json::{Value as JsonValue, json};

use courier_core::{CapabilityError, CapabilityResult, MessageKind};
use courier_messaging::{CapabilityHandler, HandlerRegistry};
use courier_messaging::handler::Payload;

use crate::required_str;

/// Argon2id cost parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl HashCost {
    /// Cheapest parameters Argon2 accepts; for tests only.
    pub const MINIMAL: HashCost = HashCost {
        memory_kib: 8,
        iterations: 1,
        parallelism: 1,
    };
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Hashes and verifies passwords off the async runtime.
#[derive(Debug, Clone)]
pub struct HashService {
    argon2: Arc<Argon2<'static>>,
}

impl HashService {
    pub fn new() -> Self {
        Self::build(Params::default())
    }

    pub fn with_cost(cost: HashCost) -> Result<Self, CapabilityError> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| CapabilityError::invalid_input(format!("invalid argon2 parameters: {e}")))?;
        Ok(Self::build(params))
    }

    fn build(params: Params) -> Self {
        Self {
            argon2: Arc::new(Argon2::new(Algorithm::Argon2id, Version::V0x13, params)),
        }
    }

    /// Hash `password` with a fresh random salt.
    pub async fn hash(&self, password: String) -> CapabilityResult<String> {
        let argon2 = Arc::clone(&self.argon2);
        tokio::task::spawn_blocking(move || {
            let mut salt_bytes = [0u8; password_hash::Salt::RECOMMENDED_LENGTH];
            OsRng
                .try_fill_bytes(&mut salt_bytes)
                .map_err(|e| CapabilityError::external(format!("salt generation failed: {e}")))?;
            let salt = SaltString::encode_b64(&salt_bytes)
                .map_err(|e| CapabilityError::external(format!("salt encoding failed: {e}")))?;
            argon2
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|e| CapabilityError::external(format!("hashing failed: {e}")))
        })
        .await
        .map_err(|e| CapabilityError::Aborted(e.to_string()))?
    }

    /// `Ok(false)` on mismatch; a `known_hash` that is not a PHC string is invalid input.
    pub async fn verify(&self, known_hash: String, attempt: String) -> CapabilityResult<bool> {
        let argon2 = Arc::clone(&self.argon2);
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&known_hash)
                .map_err(|e| CapabilityError::invalid_input(format!("known_hash is not a valid hash: {e}")))?;
            match argon2.verify_password(attempt.as_bytes(), &parsed) {
                Ok(()) => Ok(true),
                Err(password_hash::Error::Password) => Ok(false),
                Err(e) => Err(CapabilityError::invalid_input(format!(
                    "known_hash cannot be verified: {e}"
                ))),
            }
        })
        .await
        .map_err(|e| CapabilityError::Aborted(e.to_string()))?
    }

    /// Handler table for the hash queue.
    pub fn handlers(self) -> HandlerRegistry {
        let service = Arc::new(self);
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(MessageKind::CreateHash, service.clone())
            .register(MessageKind::ValidateHash, service);
        handlers
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityHandler for HashService {
    async fn handle(&self, kind: MessageKind, payload: Payload) -> CapabilityResult<JsonValue> {
        match kind {
            MessageKind::CreateHash => {
                let password = required_str(&payload, "password")?;
                Ok(json!(self.hash(password).await?))
            }
            MessageKind::ValidateHash => {
                let known_hash = required_str(&payload, "known_hash")?;
                let attempt = required_str(&payload, "attempt")?;
                Ok(json!(self.verify(known_hash, attempt).await?))
            }
            other => Err(CapabilityError::Unhandled(other.to_string())),
        }
    }
}
