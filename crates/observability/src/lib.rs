//! Tracing and structured logging (shared setup).

/// Initialize process-wide tracing/logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(None);
}

/// Like [`init`], then record which service this process runs.
pub fn init_for(service: &str) {
    tracing::init(Some(service));
}

/// Tracing configuration (filters, layers).
pub mod tracing;
