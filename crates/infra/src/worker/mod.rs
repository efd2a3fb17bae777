//! Worker side of request/reply.

mod server;

pub use server::{WORKER_PREFETCH, WorkerError, WorkerHandle, WorkerServer, WorkerStats};
