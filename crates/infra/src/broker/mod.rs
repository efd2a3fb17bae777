//! Networked broker adapters.
//!
//! The in-process broker lives in `courier-messaging`; adapters here talk to an
//! external server and are gated behind cargo features.

#[cfg(feature = "redis")]
pub mod redis_lists;

#[cfg(feature = "redis")]
pub use redis_lists::RedisBroker;
