//! Redis-backed broker (list queues, at-least-once delivery).
//!
//! This implementation maps the broker primitives onto Redis lists:
//! - **Queues**: `courier:q:{name}`; publish is `LPUSH`, consumption takes from the right
//! - **Declaration**: `courier:meta:{name}` hash holds flags, owner and TTLs; a queue
//!   exists while its meta key exists
//! - **In-flight**: each channel moves deliveries into `courier:inflight:{channel}`
//!   with `BLMOVE`; `ack` removes them, closing the channel pushes them back
//! - **Expiry**: message TTL is checked on delivery; queue expiry is a `PEXPIRE`
//!   on both the meta and the list key, refreshed while a consumer polls
//! - **Leases**: every open channel renews `courier:alive:{channel}` and every
//!   exclusive queue its own keys from a per-connection heartbeat, so a crashed
//!   process leaves nothing behind once its lease lapses
//! - **Reclaim**: `connect` requeues the in-flight lists of channels whose lease
//!   has lapsed
//!
//! Commands run on the blocking pool with a fresh connection per operation.
//! A run of consecutive transport failures closes the connection and all of its
//! channels, which ends their consumer streams.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use courier_core::{DeliveryTag, QueueConfig};
use courier_messaging::{
    Broker, BrokerError, Channel, Connection, ConsumeOptions, Consumer, Delivery,
    MessageProperties,
};

/// Default key prefix.
const DEFAULT_KEY_PREFIX: &str = "courier";

/// Seconds a `BLMOVE` blocks before the consumer re-checks its state.
const BLOCK_SECS: u64 = 1;

/// Pause after a failed poll or while waiting for prefetch capacity.
const POLL_PAUSE: Duration = Duration::from_millis(250);

/// How long a channel or exclusive queue outlives its last heartbeat.
const LEASE: Duration = Duration::from_secs(15);
const LEASE_MS: u64 = LEASE.as_millis() as u64;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive transport failures after which a connection is given up.
const MAX_CONSECUTIVE_FAILURES: u32 = 8;

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn queue(&self, name: &str) -> String {
        format!("{}:q:{}", self.prefix, name)
    }

    fn meta(&self, name: &str) -> String {
        format!("{}:meta:{}", self.prefix, name)
    }

    fn inflight(&self, channel_id: &str) -> String {
        format!("{}:inflight:{}", self.prefix, channel_id)
    }

    fn alive(&self, channel_id: &str) -> String {
        format!("{}:alive:{}", self.prefix, channel_id)
    }

    fn reclaim(&self, channel_id: &str) -> String {
        format!("{}:reclaim:{}", self.prefix, channel_id)
    }

    fn channel_of_inflight<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?
            .strip_prefix(":inflight:")
            .filter(|id| !id.is_empty())
    }
}

/// How a queue list should expire, given the `PTTL` of its meta key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ListExpiry {
    Never,
    After(i64),
}

/// `None` when the queue no longer exists.
fn list_expiry(meta_pttl: i64) -> Option<ListExpiry> {
    match meta_pttl {
        -2 => None,
        ms if ms >= 0 => Some(ListExpiry::After(ms.max(1))),
        _ => Some(ListExpiry::Never),
    }
}

/// Consecutive transport failures on one connection.
#[derive(Debug, Default)]
struct FailureCount(AtomicU32);

impl FailureCount {
    /// Count one outcome; true once the run reaches [`MAX_CONSECUTIVE_FAILURES`].
    /// Any answer from the server, including a logical error, ends the run.
    fn record<T>(&self, outcome: &Result<T, BrokerError>) -> bool {
        match outcome {
            Err(BrokerError::Unreachable(_) | BrokerError::Transport(_)) => {
                self.0.fetch_add(1, Ordering::SeqCst) + 1 >= MAX_CONSECUTIVE_FAILURES
            }
            _ => {
                self.0.store(0, Ordering::SeqCst);
                false
            }
        }
    }
}

/// Message as stored in a queue list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    queue: String,
    body: Vec<u8>,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    expires_at_ms: Option<i64>,
    redelivered: bool,
}

impl StoredRecord {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

async fn blocking<T, F>(client: &Arc<redis::Client>, op: F) -> Result<T, BrokerError>
where
    T: Send + 'static,
    F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
{
    let client = Arc::clone(client);
    tokio::task::spawn_blocking(move || {
        let mut conn = client
            .get_connection()
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        op(&mut conn).map_err(|e| BrokerError::Transport(e.to_string()))
    })
    .await
    .map_err(|e| BrokerError::Transport(format!("redis task failed: {e}")))?
}

/// Push in-flight records back onto their queues, flagged redelivered.
///
/// Records whose queue is gone are dropped. `raw` is in `LRANGE` order (newest
/// first), so the oldest record is pushed last and taken first.
fn requeue(conn: &mut redis::Connection, keys: &Keys, raw: &[String]) -> redis::RedisResult<usize> {
    let mut count = 0usize;
    for entry in raw {
        let Ok(mut record) = serde_json::from_str::<StoredRecord>(entry) else {
            continue;
        };
        let pttl: i64 = redis::cmd("PTTL").arg(keys.meta(&record.queue)).query(conn)?;
        let Some(expiry) = list_expiry(pttl) else {
            continue;
        };
        record.redelivered = true;
        let Ok(encoded) = serde_json::to_string(&record) else {
            continue;
        };
        let queue_key = keys.queue(&record.queue);
        let mut pipe = redis::pipe();
        pipe.rpush(&queue_key, encoded).ignore();
        if let ListExpiry::After(ms) = expiry {
            pipe.cmd("PEXPIRE").arg(&queue_key).arg(ms).ignore();
        }
        pipe.query::<()>(conn)?;
        count += 1;
    }
    Ok(count)
}

/// Requeue the in-flight lists of channels whose lease has lapsed.
fn reclaim_orphans(conn: &mut redis::Connection, keys: &Keys) -> redis::RedisResult<usize> {
    let pattern = keys.inflight("*");
    let mut found = Vec::new();
    let mut cursor = 0u64;
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query(conn)?;
        found.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }

    let mut reclaimed = 0usize;
    for key in &found {
        let Some(channel_id) = keys.channel_of_inflight(key) else {
            continue;
        };
        let alive: bool = redis::cmd("EXISTS").arg(keys.alive(channel_id)).query(conn)?;
        if alive {
            continue;
        }
        // Take the list first so concurrent sweeps never requeue it twice.
        let claimed = keys.reclaim(channel_id);
        match redis::cmd("RENAME").arg(key).arg(&claimed).query::<()>(conn) {
            Ok(()) => {}
            Err(e) if e.kind() == redis::ErrorKind::ResponseError => continue,
            Err(e) => return Err(e),
        }
        let raw: Vec<String> = redis::cmd("LRANGE").arg(&claimed).arg(0).arg(-1).query(conn)?;
        reclaimed += requeue(conn, keys, &raw)?;
        redis::cmd("DEL").arg(&claimed).query::<()>(conn)?;
    }
    Ok(reclaimed)
}

/// Broker backed by a Redis server.
#[derive(Debug, Clone)]
pub struct RedisBroker {
    client: Arc<redis::Client>,
    keys: Keys,
}

impl RedisBroker {
    /// Create a broker for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// No connection is made until [`Broker::connect`].
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            keys: Keys {
                prefix: DEFAULT_KEY_PREFIX.to_string(),
            },
        })
    }

    /// Namespace every key under `prefix` instead of `courier`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys.prefix = prefix.into();
        self
    }

    async fn open(&self) -> Result<RedisConnection, BrokerError> {
        let _: String = blocking(&self.client, |conn| redis::cmd("PING").query(conn)).await?;

        let keys = self.keys.clone();
        let reclaimed = blocking(&self.client, move |conn| reclaim_orphans(conn, &keys)).await?;
        if reclaimed > 0 {
            info!(reclaimed, "requeued deliveries of lapsed channels");
        }

        let connection = RedisConnection::new(Arc::clone(&self.client), self.keys.clone());
        tokio::spawn(heartbeat(
            Arc::clone(&self.client),
            self.keys.clone(),
            Arc::downgrade(&connection.state),
        ));
        debug!(connection = %connection.state.id, "redis connection opened");
        Ok(connection)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self), err)]
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        Ok(Arc::new(self.open().await?))
    }
}

#[derive(Debug)]
struct ConnectionShared {
    id: String,
    open: AtomicBool,
    failures: FailureCount,
    channels: Mutex<Vec<Arc<ChannelShared>>>,
    /// Exclusive queues declared here, with their `expires` in millis.
    owned_queues: Mutex<HashMap<String, Option<i64>>>,
}

impl ConnectionShared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn record<T>(&self, outcome: &Result<T, BrokerError>) {
        if self.failures.record(outcome) {
            self.mark_lost();
        }
    }

    /// Close without touching Redis; leases lapse and the next `connect`
    /// reclaims what was in flight.
    fn mark_lost(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        for channel in lock(&self.channels).iter() {
            channel.open.store(false, Ordering::SeqCst);
            channel.capacity.notify_waiters();
        }
        error!(
            connection = %self.id,
            failures = MAX_CONSECUTIVE_FAILURES,
            "redis unreachable; connection closed"
        );
    }
}

/// Renew channel leases and exclusive queues until the connection closes.
async fn heartbeat(client: Arc<redis::Client>, keys: Keys, state: Weak<ConnectionShared>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        if !state.is_open() {
            break;
        }

        let channels: Vec<String> = {
            let mut channels = lock(&state.channels);
            channels.retain(|c| c.open.load(Ordering::SeqCst));
            channels.iter().map(|c| c.id.clone()).collect()
        };
        let leased: Vec<String> = lock(&state.owned_queues)
            .iter()
            .filter(|(_, expires)| expires.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        if channels.is_empty() && leased.is_empty() {
            continue;
        }

        let keys = keys.clone();
        let outcome = blocking(&client, move |conn| {
            let mut pipe = redis::pipe();
            for id in &channels {
                pipe.cmd("SET").arg(keys.alive(id)).arg(1).arg("PX").arg(LEASE_MS).ignore();
            }
            for name in &leased {
                pipe.cmd("PEXPIRE").arg(keys.meta(name)).arg(LEASE_MS).ignore();
                pipe.cmd("PEXPIRE").arg(keys.queue(name)).arg(LEASE_MS).ignore();
            }
            pipe.query::<()>(conn)
        })
        .await;
        if let Err(e) = &outcome {
            warn!(connection = %state.id, error = %e, "redis heartbeat failed");
        }
        state.record(&outcome);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct RedisConnection {
    client: Arc<redis::Client>,
    keys: Keys,
    state: Arc<ConnectionShared>,
}

impl RedisConnection {
    fn new(client: Arc<redis::Client>, keys: Keys) -> Self {
        Self {
            client,
            keys,
            state: Arc::new(ConnectionShared {
                id: Uuid::new_v4().simple().to_string(),
                open: AtomicBool::new(true),
                failures: FailureCount::default(),
                channels: Mutex::new(Vec::new()),
                owned_queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn channel_state(&self) -> Arc<ChannelShared> {
        let shared = Arc::new(ChannelShared {
            client: Arc::clone(&self.client),
            keys: self.keys.clone(),
            id: Uuid::new_v4().simple().to_string(),
            connection: Arc::clone(&self.state),
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
            next_tag: AtomicU64::new(0),
            unacked: Mutex::new(BTreeMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            capacity: Notify::new(),
        });
        lock(&self.state.channels).push(Arc::clone(&shared));
        shared
    }
}

/// Dropping an unclosed connection behaves like a crash: leases stop renewing.
impl Drop for RedisConnection {
    fn drop(&mut self) {
        self.state.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if !self.state.is_open() {
            return Err(BrokerError::ConnectionClosed);
        }
        let shared = self.channel_state();
        let alive = self.keys.alive(&shared.id);
        let leased = shared
            .command(move |conn| {
                redis::cmd("SET")
                    .arg(&alive)
                    .arg(1)
                    .arg("PX")
                    .arg(LEASE_MS)
                    .query::<()>(conn)
            })
            .await;
        if let Err(e) = leased {
            shared.open.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(Arc::new(RedisChannel { shared }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.state.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let channels: Vec<Arc<ChannelShared>> = lock(&self.state.channels).drain(..).collect();
        for channel in channels {
            channel.close().await?;
        }

        let owned: Vec<String> = lock(&self.state.owned_queues)
            .drain()
            .map(|(name, _)| name)
            .collect();
        if !owned.is_empty() {
            let keys = self.keys.clone();
            blocking(&self.client, move |conn| {
                let mut pipe = redis::pipe();
                for name in &owned {
                    pipe.del(keys.queue(name)).ignore();
                    pipe.del(keys.meta(name)).ignore();
                }
                pipe.query::<()>(conn)
            })
            .await?;
        }
        debug!(connection = %self.state.id, "redis connection closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }
}

#[derive(Debug)]
struct ChannelShared {
    client: Arc<redis::Client>,
    keys: Keys,
    id: String,
    connection: Arc<ConnectionShared>,
    open: AtomicBool,
    prefetch: AtomicU16,
    next_tag: AtomicU64,
    /// Delivery tag → raw record currently in this channel's in-flight list.
    unacked: Mutex<BTreeMap<u64, String>>,
    cancelled: Mutex<HashSet<String>>,
    capacity: Notify,
}

impl ChannelShared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection.is_open()
    }

    /// Run a command and count its outcome against the connection.
    async fn command<T, F>(&self, op: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let outcome = blocking(&self.client, op).await;
        self.connection.record(&outcome);
        outcome
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn has_capacity(&self) -> bool {
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        prefetch == 0 || lock(&self.unacked).len() < usize::from(prefetch)
    }

    /// Mark closed and push every in-flight record back onto its queue.
    async fn close(&self) -> Result<(), BrokerError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        lock(&self.unacked).clear();
        self.capacity.notify_waiters();

        let keys = self.keys.clone();
        let (inflight, alive) = (keys.inflight(&self.id), keys.alive(&self.id));
        let requeued = self
            .command(move |conn| {
                let raw: Vec<String> =
                    redis::cmd("LRANGE").arg(&inflight).arg(0).arg(-1).query(conn)?;
                let count = requeue(conn, &keys, &raw)?;
                redis::pipe()
                    .del(&inflight)
                    .ignore()
                    .del(&alive)
                    .ignore()
                    .query::<()>(conn)?;
                Ok(count)
            })
            .await?;

        if requeued > 0 {
            debug!(channel = %self.id, requeued, "unacked deliveries requeued");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct RedisChannel {
    shared: Arc<ChannelShared>,
}

enum DeclareOutcome {
    Created,
    Existing,
    Mismatch,
    Locked,
}

#[async_trait]
impl Channel for RedisChannel {
    #[instrument(skip(self, config), fields(queue = %config.name), err)]
    async fn declare_queue(&self, config: &QueueConfig) -> Result<String, BrokerError> {
        self.shared.ensure_open()?;
        let name = if config.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            config.name.clone()
        };

        let keys = self.shared.keys.clone();
        let owner = self.shared.connection.id.clone();
        let config = config.clone();
        let queue_name = name.clone();
        let outcome = self.shared.command(move |conn| {
            let meta_key = keys.meta(&queue_name);
            let existing: HashMap<String, String> =
                redis::cmd("HGETALL").arg(&meta_key).query(conn)?;

            if !existing.is_empty() {
                let durable = existing.get("durable").map(String::as_str) == Some("1");
                let exclusive = existing.get("exclusive").map(String::as_str) == Some("1");
                if durable != config.durable || exclusive != config.exclusive {
                    return Ok(DeclareOutcome::Mismatch);
                }
                if exclusive && existing.get("owner") != Some(&owner) {
                    return Ok(DeclareOutcome::Locked);
                }
                return Ok(DeclareOutcome::Existing);
            }

            let mut pipe = redis::pipe();
            pipe.hset(&meta_key, "durable", if config.durable { "1" } else { "0" })
                .ignore()
                .hset(&meta_key, "exclusive", if config.exclusive { "1" } else { "0" })
                .ignore();
            if config.exclusive {
                pipe.hset(&meta_key, "owner", &owner).ignore();
            }
            if let Some(ttl) = config.message_ttl {
                pipe.hset(&meta_key, "message_ttl_ms", ttl.as_millis() as u64).ignore();
            }
            // Exclusive queues without their own expiry live on the owner's lease.
            let expire_ms = match config.expires {
                Some(expires) => {
                    let ms = expires.as_millis() as i64;
                    pipe.hset(&meta_key, "expires_ms", ms).ignore();
                    Some(ms)
                }
                None if config.exclusive => Some(LEASE_MS as i64),
                None => None,
            };
            if let Some(ms) = expire_ms {
                pipe.cmd("PEXPIRE").arg(&meta_key).arg(ms).ignore();
                pipe.cmd("PEXPIRE").arg(keys.queue(&queue_name)).arg(ms).ignore();
            }
            pipe.query::<()>(conn)?;
            Ok(DeclareOutcome::Created)
        })
        .await?;

        match outcome {
            DeclareOutcome::Mismatch => Err(BrokerError::PreconditionFailed(name)),
            DeclareOutcome::Locked => Err(BrokerError::ResourceLocked(name)),
            DeclareOutcome::Existing => Ok(name),
            DeclareOutcome::Created => {
                if config.exclusive {
                    let expires = config.expires.map(|e| e.as_millis() as i64);
                    lock(&self.shared.connection.owned_queues).insert(name.clone(), expires);
                }
                debug!(queue = %name, "queue declared");
                Ok(name)
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        self.shared.prefetch.store(count, Ordering::SeqCst);
        self.shared.capacity.notify_waiters();
        Ok(())
    }

    #[instrument(skip(self, body, properties), fields(queue = %queue, bytes = body.len()), err)]
    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        let keys = self.shared.keys.clone();
        let queue_name = queue.to_string();

        let delivered = self.shared.command(move |conn| {
            let meta_key = keys.meta(&queue_name);
            let (meta, meta_pttl): (HashMap<String, String>, i64) = redis::pipe()
                .cmd("HGETALL")
                .arg(&meta_key)
                .cmd("PTTL")
                .arg(&meta_key)
                .query(conn)?;
            let Some(expiry) = list_expiry(meta_pttl).filter(|_| !meta.is_empty()) else {
                return Ok(false);
            };

            let queue_ttl = meta
                .get("message_ttl_ms")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis);
            let ttl = match (queue_ttl, properties.expiration) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let record = StoredRecord {
                id: Uuid::new_v4().simple().to_string(),
                queue: queue_name.clone(),
                body,
                reply_to: properties.reply_to,
                correlation_id: properties.correlation_id,
                expires_at_ms: ttl.map(|t| now_ms() + t.as_millis() as i64),
                redelivered: false,
            };
            let encoded = serde_json::to_string(&record).map_err(|e| {
                redis::RedisError::from((redis::ErrorKind::TypeError, "encode", e.to_string()))
            })?;
            // The list must not outlive its meta key when a late publish recreates it.
            let queue_key = keys.queue(&queue_name);
            let mut pipe = redis::pipe();
            pipe.cmd("LPUSH").arg(&queue_key).arg(encoded).ignore();
            if let ListExpiry::After(ms) = expiry {
                pipe.cmd("PEXPIRE").arg(&queue_key).arg(ms).ignore();
            }
            pipe.query::<()>(conn)?;
            Ok(true)
        })
        .await?;

        if !delivered {
            debug!(queue = %queue, "publish to unknown queue dropped");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError> {
        self.shared.ensure_open()?;
        let keys = self.shared.keys.clone();
        let queue_name = queue.to_string();
        let meta: HashMap<String, String> = self
            .shared
            .command(move |conn| redis::cmd("HGETALL").arg(keys.meta(&queue_name)).query(conn))
            .await?;

        if meta.is_empty() {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        if meta.get("exclusive").map(String::as_str) == Some("1")
            && meta.get("owner") != Some(&self.shared.connection.id)
        {
            return Err(BrokerError::ResourceLocked(queue.to_string()));
        }

        let expires = meta
            .get("expires_ms")
            .and_then(|v| v.parse::<i64>().ok());
        let (tx, rx) = mpsc::unbounded_channel();
        let tag = format!("ctag-{}", Uuid::new_v4().simple());
        tokio::spawn(run_consumer(
            Arc::clone(&self.shared),
            queue.to_string(),
            tag.clone(),
            options.no_ack,
            expires,
            tx,
        ));
        Ok(Consumer::new(tag, rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        lock(&self.shared.cancelled).insert(consumer_tag.to_string());
        self.shared.capacity.notify_waiters();
        Ok(())
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        let Some(raw) = lock(&self.shared.unacked).remove(&delivery_tag.value()) else {
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        };
        let inflight = self.shared.keys.inflight(&self.shared.id);
        self.shared
            .command(move |conn| redis::cmd("LREM").arg(&inflight).arg(1).arg(raw).query::<()>(conn))
            .await?;
        self.shared.capacity.notify_waiters();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        let keys = self.shared.keys.clone();
        let owner = self.shared.connection.id.clone();
        let queue_name = queue.to_string();
        let locked = self.shared.command(move |conn| {
            let current: Option<String> = redis::cmd("HGET")
                .arg(keys.meta(&queue_name))
                .arg("owner")
                .query(conn)?;
            if current.is_some_and(|o| o != owner) {
                return Ok(true);
            }
            redis::pipe()
                .del(keys.queue(&queue_name))
                .ignore()
                .del(keys.meta(&queue_name))
                .ignore()
                .query::<()>(conn)?;
            Ok(false)
        })
        .await?;

        if locked {
            return Err(BrokerError::ResourceLocked(queue.to_string()));
        }
        lock(&self.shared.connection.owned_queues).remove(queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.close().await
    }

    fn is_open(&self) -> bool {
        self.shared.is_open()
    }
}

/// Poll one queue into one consumer until it is cancelled, its channel
/// closes, or the receiving side goes away.
async fn run_consumer(
    shared: Arc<ChannelShared>,
    queue: String,
    tag: String,
    no_ack: bool,
    expires_ms: Option<i64>,
    tx: mpsc::UnboundedSender<Delivery>,
) {
    let queue_key = shared.keys.queue(&queue);
    let meta_key = shared.keys.meta(&queue);
    let inflight = shared.keys.inflight(&shared.id);

    loop {
        if !shared.is_open() || tx.is_closed() || lock(&shared.cancelled).contains(&tag) {
            break;
        }
        if !no_ack && !shared.has_capacity() {
            tokio::select! {
                _ = shared.capacity.notified() => {}
                _ = tokio::time::sleep(POLL_PAUSE) => {}
            }
            continue;
        }

        let (source, target, meta) = (queue_key.clone(), inflight.clone(), meta_key.clone());
        let moved = shared.command(move |conn| {
            if let Some(ms) = expires_ms {
                // An active consumer keeps an expiring queue alive.
                redis::pipe()
                    .cmd("PEXPIRE")
                    .arg(&meta)
                    .arg(ms)
                    .ignore()
                    .cmd("PEXPIRE")
                    .arg(&source)
                    .arg(ms)
                    .ignore()
                    .query::<()>(conn)?;
            }
            redis::cmd("BLMOVE")
                .arg(&source)
                .arg(&target)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(BLOCK_SECS)
                .query::<Option<String>>(conn)
        })
        .await;

        let raw = match moved {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) if shared.is_open() => {
                warn!(queue = %queue, error = %e, "redis consumer poll failed");
                tokio::time::sleep(POLL_PAUSE).await;
                continue;
            }
            Err(_) => break,
        };

        let record = match serde_json::from_str::<StoredRecord>(&raw) {
            Ok(record) if !record.is_expired(now_ms()) => record,
            outcome => {
                if outcome.is_ok() {
                    debug!(queue = %queue, "expired message discarded");
                } else {
                    warn!(queue = %queue, "undecodable queue record discarded");
                }
                let target = inflight.clone();
                let _ = shared
                    .command(move |conn| redis::cmd("LREM").arg(&target).arg(1).arg(raw).query::<()>(conn))
                    .await;
                continue;
            }
        };

        let delivery_tag = shared.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        if no_ack {
            let target = inflight.clone();
            let removed = raw.clone();
            let _ = shared
                .command(move |conn| redis::cmd("LREM").arg(&target).arg(1).arg(removed).query::<()>(conn))
                .await;
        } else {
            lock(&shared.unacked).insert(delivery_tag, raw.clone());
        }

        let delivery = Delivery {
            delivery_tag: DeliveryTag::new(delivery_tag),
            queue: queue.clone(),
            body: record.body,
            properties: MessageProperties {
                reply_to: record.reply_to,
                correlation_id: record.correlation_id,
                expiration: None,
            },
            redelivered: record.redelivered,
        };

        if tx.send(delivery).is_err() {
            if !no_ack && lock(&shared.unacked).remove(&delivery_tag).is_some() {
                // Receiver vanished before seeing the delivery: put it back.
                let (target, source) = (inflight.clone(), queue_key.clone());
                let _ = shared.command(move |conn| {
                    redis::pipe()
                        .cmd("LREM")
                        .arg(&target)
                        .arg(1)
                        .arg(&raw)
                        .ignore()
                        .rpush(&source, &raw)
                        .ignore()
                        .query::<()>(conn)
                })
                .await;
            }
            break;
        }
    }

    debug!(queue = %queue, consumer = %tag, "redis consumer stopped");
}
