//! Gateway: typed facade over the RPC client plus its HTTP surface.

pub mod app;
pub mod errors;
pub mod gateway;

pub use errors::GatewayError;
pub use gateway::{Gateway, Service};
