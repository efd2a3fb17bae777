//! `courier-core` — shared message contract primitives.
//!
//! This crate contains the **wire vocabulary** every service agrees on (no
//! transport concerns): message kinds, envelopes, correlation identifiers and
//! queue configuration.

pub mod envelope;
pub mod error;
pub mod id;
pub mod kind;
pub mod queue;

pub use envelope::Envelope;
pub use error::{CapabilityError, CapabilityResult};
pub use id::{CorrelationId, DeliveryTag};
pub use kind::{KindProfile, MessageKind, INTERNAL_CORRELATION_FIELD};
pub use queue::{CallClass, QueueConfig};
