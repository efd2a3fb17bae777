//! Broker messaging contract: transport traits, in-process broker, and the
//! validation/dispatch contract shared by every service.

pub mod bus;
pub mod contract;
pub mod handler;
pub mod in_memory_bus;
pub mod schema;
pub mod validator;

pub use bus::{
    Broker, BrokerError, Channel, Connection, ConsumeOptions, Consumer, Delivery,
    MessageProperties,
};
pub use contract::QueueContract;
pub use handler::{CapabilityHandler, FnHandler, HandlerRegistry, handler_fn};
pub use in_memory_bus::{InMemoryBroker, QueueStats};
pub use schema::{FieldSpec, FieldType, PayloadSchema, schema_for};
pub use validator::{
    MessageValidator, RawEnvelope, ValidatedMessage, ValidationError, redact,
    DEFAULT_MAX_ENVELOPE_BYTES,
};
