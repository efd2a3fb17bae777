//! Correlation table for calls awaiting a reply on a shared reply queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use courier_core::CorrelationId;

use super::CallError;

type Settle = oneshot::Sender<Result<JsonValue, CallError>>;

/// Pending calls keyed by correlation id.
///
/// Each entry is removed exactly once: by the reply router when a matching
/// reply arrives, or by the caller's [`PendingGuard`] when it stops waiting.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, Settle>>,
}

impl PendingCalls {
    pub(crate) fn register(
        self: &Arc<Self>,
        id: &CorrelationId,
    ) -> (PendingGuard, oneshot::Receiver<Result<JsonValue, CallError>>) {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.as_str().to_string(), tx);
        let guard = PendingGuard {
            calls: Arc::clone(self),
            id: id.as_str().to_string(),
        };
        (guard, rx)
    }

    /// Settle the call waiting on `id`. Returns `false` when nobody is waiting
    /// (late reply after timeout, or a foreign token).
    pub(crate) fn settle(&self, id: &str, outcome: Result<JsonValue, CallError>) -> bool {
        let Some(tx) = self.lock().remove(id) else {
            return false;
        };
        tx.send(outcome).is_ok()
    }

    /// Reject every outstanding call (reply consumer lost).
    pub(crate) fn fail_all(&self, error: CallError) -> usize {
        let drained: Vec<Settle> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Settle>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the caller's entry when the call stops waiting for any reason.
#[derive(Debug)]
pub(crate) struct PendingGuard {
    calls: Arc<PendingCalls>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.id);
    }
}
