//! Infrastructure layer: broker connection management, request/reply,
//! worker loop, configuration and networked broker adapters.

pub mod broker;
pub mod config;
pub mod connection;
pub mod rpc;
pub mod worker;

pub use config::{ConfigError, CourierConfig};
pub use connection::{BrokerConnection, ConnectionError, ConnectionRole, ConnectionState, RetryPolicy};
pub use rpc::{CallError, ReplyMode, RpcClient};
pub use worker::{WorkerError, WorkerHandle, WorkerServer, WorkerStats};
