//! Process-wide broker connection with lazy channel setup and bounded retry.
//!
//! Each process owns one [`BrokerConnection`] and passes it (cheaply cloned)
//! into the RPC client or worker server. The first `get_channel` connects and
//! opens a channel; later calls return the cached channel.
//!
//! ## Retry budget
//!
//! The retry counter lives for the whole process and is never reset. Every
//! failed attempt consumes one retry (fixed delay, no backoff) until the budget
//! is spent; from then on each `get_channel` makes a single attempt and fails
//! immediately with [`ConnectionError::RetriesExhausted`].
//!
//! Exhaustion moves the observable state to [`ConnectionState::Unrecoverable`].
//! What happens next is the supervisor's call: the worker binary exits the
//! process, the gateway keeps serving and reports the error per request.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, instrument, warn};

use courier_messaging::{Broker, BrokerError, Channel, Connection};

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Which kind of process owns the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionRole {
    Worker,
    Gateway,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Worker => f.write_str("worker"),
            ConnectionRole::Gateway => f.write_str("gateway"),
        }
    }
}

/// Fixed-delay, bounded retry policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// Observable lifecycle of the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing opened yet.
    Idle,
    Connecting,
    Connected,
    /// Closed on request; a later `get_channel` starts over.
    Closed,
    /// The retry budget is spent.
    Unrecoverable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("broker connection unrecoverable after {attempts} retries: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Default)]
struct Slot {
    connection: Option<Arc<dyn Connection>>,
    channel: Option<Arc<dyn Channel>>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    role: ConnectionRole,
    policy: RetryPolicy,
    retries: AtomicU32,
    slot: Mutex<Slot>,
    state: watch::Sender<ConnectionState>,
}

/// Shared handle to the process's broker connection.
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("role", &self.inner.role)
            .field("policy", &self.inner.policy)
            .field("state", &self.state())
            .field("retries_used", &self.retries_used())
            .finish()
    }
}

impl BrokerConnection {
    pub fn new(broker: Arc<dyn Broker>, role: ConnectionRole) -> Self {
        Self::with_policy(broker, role, RetryPolicy::default())
    }

    pub fn with_policy(broker: Arc<dyn Broker>, role: ConnectionRole, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                broker,
                role,
                policy,
                retries: AtomicU32::new(0),
                slot: Mutex::new(Slot::default()),
                state,
            }),
        }
    }

    pub fn role(&self) -> ConnectionRole {
        self.inner.role
    }

    pub fn policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions (e.g. to exit on `Unrecoverable`).
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Retries consumed so far in this process.
    pub fn retries_used(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Return the cached channel, connecting first if needed.
    ///
    /// Concurrent first callers wait on the same attempt instead of each
    /// opening a connection.
    #[instrument(skip(self), fields(role = %self.inner.role))]
    pub async fn get_channel(&self) -> Result<Arc<dyn Channel>, ConnectionError> {
        let mut slot = self.inner.slot.lock().await;

        if let Some(channel) = slot.channel.as_ref() {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            debug!("cached channel is closed; reconnecting");
            discard(&mut slot).await;
        }

        loop {
            self.set_state(ConnectionState::Connecting);
            match self.open().await {
                Ok((connection, channel)) => {
                    slot.connection = Some(connection);
                    slot.channel = Some(Arc::clone(&channel));
                    self.set_state(ConnectionState::Connected);
                    info!(retries_used = self.retries_used(), "broker channel established");
                    return Ok(channel);
                }
                Err(e) => {
                    let used = self.inner.retries.load(Ordering::SeqCst);
                    if used >= self.inner.policy.max_attempts {
                        self.set_state(ConnectionState::Unrecoverable);
                        error!(attempts = used, error = %e, "broker connection retries exhausted");
                        return Err(ConnectionError::RetriesExhausted {
                            attempts: used,
                            last_error: e.to_string(),
                        });
                    }
                    self.inner.retries.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        attempt = used + 1,
                        max_attempts = self.inner.policy.max_attempts,
                        delay_ms = self.inner.policy.delay.as_millis() as u64,
                        error = %e,
                        "broker connection failed; retrying"
                    );
                    tokio::time::sleep(self.inner.policy.delay).await;
                }
            }
        }
    }

    /// Close the channel, then the connection. No-op when nothing is open.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.channel.is_none() && slot.connection.is_none() {
            return Ok(());
        }
        let channel = slot.channel.take();
        let connection = slot.connection.take();
        if let Some(channel) = channel {
            channel.close().await?;
        }
        if let Some(connection) = connection {
            connection.close().await?;
        }
        self.set_state(ConnectionState::Closed);
        info!(role = %self.inner.role, "broker connection closed");
        Ok(())
    }

    /// Forget a channel the transport reported closed so the next
    /// `get_channel` reconnects.
    pub async fn invalidate(&self) {
        let mut slot = self.inner.slot.lock().await;
        if slot.channel.is_some() || slot.connection.is_some() {
            warn!(role = %self.inner.role, "dropping broken broker channel");
            discard(&mut slot).await;
        }
    }

    async fn open(&self) -> Result<(Arc<dyn Connection>, Arc<dyn Channel>), BrokerError> {
        let connection = self.inner.broker.connect().await?;
        match connection.create_channel().await {
            Ok(channel) => Ok((connection, channel)),
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            // Unrecoverable only clears once a later attempt actually connects.
            if *current == ConnectionState::Unrecoverable && next == ConnectionState::Connecting {
                return false;
            }
            let changed = *current != next;
            *current = next;
            changed
        });
    }
}

async fn discard(slot: &mut Slot) {
    slot.channel = None;
    if let Some(connection) = slot.connection.take() {
        let _ = connection.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::QueueConfig;
    use courier_messaging::InMemoryBroker;

    fn connection(broker: &InMemoryBroker, policy: RetryPolicy) -> BrokerConnection {
        BrokerConnection::with_policy(Arc::new(broker.clone()), ConnectionRole::Worker, policy)
    }

    #[tokio::test]
    async fn get_channel_is_lazy_and_cached() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, RetryPolicy::default());
        assert_eq!(broker.connect_attempts(), 0);
        assert_eq!(conn.state(), ConnectionState::Idle);

        let first = conn.get_channel().await.unwrap();
        let second = conn.get_channel().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_attempt() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, RetryPolicy::default());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.get_channel().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_fixed_delay() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(3);
        let conn = connection(&broker, RetryPolicy::new(20, Duration::from_millis(1000)));

        let started = tokio::time::Instant::now();
        conn.get_channel().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(conn.retries_used(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_budget_is_unrecoverable() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);
        let conn = connection(&broker, RetryPolicy::new(5, Duration::from_millis(1000)));
        let mut states = conn.subscribe();

        let err = conn.get_channel().await.err().expect("must fail");
        assert!(matches!(err, ConnectionError::RetriesExhausted { attempts: 5, .. }));
        assert_eq!(broker.connect_attempts(), 6);
        assert_eq!(conn.state(), ConnectionState::Unrecoverable);
        states
            .wait_for(|s| *s == ConnectionState::Unrecoverable)
            .await
            .unwrap();

        // The counter is never reset: later calls fail after a single attempt.
        let started = tokio::time::Instant::now();
        assert!(conn.get_channel().await.is_err());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(broker.connect_attempts(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_shared_across_reconnects() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let conn = connection(&broker, RetryPolicy::new(3, Duration::from_millis(10)));
        conn.get_channel().await.unwrap();
        assert_eq!(conn.retries_used(), 2);

        broker.disconnect_all();
        broker.set_unreachable(true);
        assert!(matches!(
            conn.get_channel().await,
            Err(ConnectionError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_allows_fresh_start() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, RetryPolicy::default());
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Idle);

        let channel = conn.get_channel().await.unwrap();
        conn.close().await.unwrap();
        assert!(!channel.is_open());
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.close().await.unwrap();

        let reopened = conn.get_channel().await.unwrap();
        assert!(reopened.is_open());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn closed_channel_is_replaced_on_next_use() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, RetryPolicy::default());
        let channel = conn.get_channel().await.unwrap();
        channel.declare_queue(&QueueConfig::durable("jobs")).await.unwrap();

        broker.disconnect_all();
        let replacement = conn.get_channel().await.unwrap();
        assert!(!Arc::ptr_eq(&channel, &replacement));
        assert!(replacement.is_open());
    }

    #[tokio::test]
    async fn invalidate_forces_reconnect() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, RetryPolicy::default());
        conn.get_channel().await.unwrap();
        conn.invalidate().await;
        conn.get_channel().await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
    }
}
