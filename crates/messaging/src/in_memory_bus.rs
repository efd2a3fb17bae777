//! In-process broker for tests/dev and single-process deployments.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use courier_core::{DeliveryTag, QueueConfig};

use crate::bus::{
    Broker, BrokerError, Channel, Connection, ConsumeOptions, Consumer, Delivery,
    MessageProperties,
};

/// In-memory broker with AMQP-like queue semantics.
///
/// - No IO; deliveries are handed to consumers over unbounded channels
/// - Prefetch is enforced per channel, unacked deliveries are requeued on close
/// - Message TTL (queue and per-message) and queue expiry follow tokio's clock,
///   so tests can run with a paused runtime
/// - Connect failures can be injected to exercise retry policies
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    connect_attempts: AtomicU32,
    failing_connects: AtomicU32,
    unreachable: AtomicBool,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub expired: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: u64,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, ChannelState>,
}

#[derive(Debug)]
struct QueueState {
    config: QueueConfig,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    idle_since: Instant,
    stats: QueueStats,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    enqueued_at: Instant,
    redelivered: bool,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct ChannelState {
    connection_id: u64,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

impl QueueState {
    fn new(config: QueueConfig, owner: Option<u64>) -> Self {
        Self {
            config,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            idle_since: Instant::now(),
            stats: QueueStats::default(),
        }
    }

    fn is_expired(&self, message: &StoredMessage, now: Instant) -> bool {
        let ttl = match (self.config.message_ttl, message.properties.expiration) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        ttl.is_some_and(|ttl| now.duration_since(message.enqueued_at) >= ttl)
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_channel(&self, channel_id: u64) -> Result<&ChannelState, BrokerError> {
        match self.channels.get(&channel_id) {
            Some(ch) if ch.open => Ok(ch),
            _ => Err(BrokerError::ChannelClosed),
        }
    }

    /// Drop queues whose `expires` window elapsed without consumers.
    fn sweep_expired_queues(&mut self) {
        let now = Instant::now();
        self.queues.retain(|name, queue| {
            let keep = match queue.config.expires {
                Some(expires) => {
                    !queue.consumers.is_empty() || now.duration_since(queue.idle_since) < expires
                }
                None => true,
            };
            if !keep {
                debug!(queue = %name, "queue expired");
            }
            keep
        });
    }

    fn check_access(&self, queue: &str, connection_id: u64) -> Result<(), BrokerError> {
        let q = self
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        match q.owner {
            Some(owner) if owner != connection_id => Err(BrokerError::ResourceLocked(queue.to_string())),
            _ => Ok(()),
        }
    }

    /// Hand ready messages to consumers with free prefetch capacity.
    fn dispatch(&mut self, queue_name: &str) {
        let now = Instant::now();
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        let before = queue.ready.len();
        let mut kept = VecDeque::with_capacity(before);
        while let Some(message) = queue.ready.pop_front() {
            if !queue.is_expired(&message, now) {
                kept.push_back(message);
            }
        }
        queue.stats.expired += (before - kept.len()) as u64;
        queue.ready = kept;

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let idx = (queue.next_consumer + offset) % count;
                let slot = &queue.consumers[idx];
                let capacity = slot.no_ack
                    || self
                        .channels
                        .get(&slot.channel_id)
                        .is_some_and(|ch| ch.open && ch.has_capacity());
                if capacity {
                    chosen = Some(idx);
                    break;
                }
            }
            let Some(idx) = chosen else {
                break;
            };

            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let slot = &queue.consumers[idx];
            let Some(channel) = self.channels.get_mut(&slot.channel_id) else {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                continue;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = Delivery {
                delivery_tag: DeliveryTag::new(tag),
                queue: queue_name.to_string(),
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
            };

            if slot.sender.send(delivery).is_err() {
                // Consumer dropped its stream; forget it and retry the message.
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                if queue.consumers.is_empty() {
                    queue.idle_since = now;
                }
                continue;
            }

            queue.stats.delivered += 1;
            if slot.no_ack {
                queue.stats.acked += 1;
            } else {
                channel.unacked.insert(tag, (queue_name.to_string(), message));
            }
            queue.next_consumer = (idx + 1) % queue.consumers.len();
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let unacked = std::mem::take(&mut channel.unacked);

        let now = Instant::now();
        for queue in self.queues.values_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|slot| slot.channel_id != channel_id);
            if before > 0 && queue.consumers.is_empty() {
                queue.idle_since = now;
            }
            queue.next_consumer = 0;
        }

        // Requeue in reverse so the oldest delivery ends up at the front.
        for (_, (queue_name, mut message)) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }

        self.dispatch_all();
    }

    fn close_connection(&mut self, connection_id: u64) {
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
            self.channels.remove(&id);
        }
        self.queues.retain(|_, q| q.owner != Some(connection_id));
        self.connections.insert(connection_id, false);
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Refuse (or accept again) every connection attempt.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of `connect` calls observed so far.
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Simulate the broker dropping every connection.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, open)| **open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        let mut state = self.lock();
        state.sweep_expired_queues();
        state.queues.contains_key(name)
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        let mut state = self.lock();
        state.sweep_expired_queues();
        state.dispatch(name);
        let unacked = state
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|(queue, _)| queue == name)
            .count();
        state.queues.get(name).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked,
            consumers: q.consumers.len(),
            ..q.stats
        })
    }

    /// Names of every queue currently declared.
    pub fn queue_names(&self) -> Vec<String> {
        let mut state = self.lock();
        state.sweep_expired_queues();
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test thread panicked mid-operation; the
        // state itself is still consistent enough to inspect.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("connection refused".to_string()));
        }
        let failing = self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BrokerError::Unreachable("connection refused".to_string()));
        }

        let id = {
            let mut state = self.lock();
            let id = state.next_id();
            state.connections.insert(id, true);
            id
        };
        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

#[derive(Debug)]
struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.get(&self.id).copied().unwrap_or(false) {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
            connection_id: self.id,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.lock().close_connection(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }
}

#[derive(Debug)]
struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    connection_id: u64,
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_queue(&self, config: &QueueConfig) -> Result<String, BrokerError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.sweep_expired_queues();

        let name = if config.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            config.name.clone()
        };

        if let Some(existing) = state.queues.get_mut(&name) {
            if existing.config.durable != config.durable
                || existing.config.exclusive != config.exclusive
            {
                return Err(BrokerError::PreconditionFailed(name));
            }
            if existing.owner.is_some_and(|owner| owner != self.connection_id) {
                return Err(BrokerError::ResourceLocked(name));
            }
            existing.idle_since = Instant::now();
            return Ok(name);
        }

        let owner = config.exclusive.then_some(self.connection_id);
        let mut stored = config.clone();
        stored.name = name.clone();
        state.queues.insert(name.clone(), QueueState::new(stored, owner));
        debug!(queue = %name, durable = config.durable, exclusive = config.exclusive, "queue declared");
        Ok(name)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        state.dispatch_all();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.sweep_expired_queues();

        let Some(q) = state.queues.get_mut(queue) else {
            debug!(queue = %queue, "publish to unknown queue dropped");
            return Ok(());
        };
        q.stats.published += 1;
        q.ready.push_back(StoredMessage {
            body,
            properties,
            enqueued_at: Instant::now(),
            redelivered: false,
        });
        state.dispatch(queue);
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.sweep_expired_queues();
        state.check_access(queue, self.connection_id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let tag = format!("ctag-{}", Uuid::new_v4().simple());
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                channel_id: self.id,
                no_ack: options.no_ack,
                sender: tx,
            });
        }
        state.dispatch(queue);
        Ok(Consumer::new(tag, rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let now = Instant::now();
        for queue in state.queues.values_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|slot| slot.tag != consumer_tag);
            if before > 0 && queue.consumers.is_empty() {
                queue.idle_since = now;
            }
            queue.next_consumer = 0;
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|ch| ch.unacked.remove(&delivery_tag.value()));
        let Some((queue_name, _)) = removed else {
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        };
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.stats.acked += 1;
        }
        // A freed prefetch slot may unblock any queue this channel consumes.
        state.dispatch_all();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let locked = state
            .queues
            .get(queue)
            .and_then(|q| q.owner)
            .is_some_and(|owner| owner != self.connection_id);
        if locked {
            return Err(BrokerError::ResourceLocked(queue.to_string()));
        }
        state.queues.remove(queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().open_channel(self.id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn channel(broker: &InMemoryBroker) -> (Arc<dyn Connection>, Arc<dyn Channel>) {
        let conn = broker.connect().await.unwrap();
        let ch = conn.create_channel().await.unwrap();
        (conn, ch)
    }

    #[tokio::test]
    async fn prefetch_withholds_deliveries_until_ack() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue(&QueueConfig::durable("work")).await.unwrap();
        ch.set_prefetch(1).await.unwrap();

        for i in 0..3u8 {
            ch.publish("work", vec![i], MessageProperties::new()).await.unwrap();
        }

        let mut consumer = ch.consume("work", ConsumeOptions::default()).await.unwrap();
        let first = consumer.recv().await.unwrap();
        assert_eq!(first.body, vec![0]);
        assert!(consumer.try_recv().is_none(), "second delivery must be withheld");
        assert_eq!(broker.queue_stats("work").unwrap().unacked, 1);

        ch.ack(first.delivery_tag).await.unwrap();
        let second = consumer.recv().await.unwrap();
        assert_eq!(second.body, vec![1]);
        assert!(consumer.try_recv().is_none());
    }

    #[tokio::test]
    async fn unacked_deliveries_are_requeued_when_channel_closes() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        ch.declare_queue(&QueueConfig::durable("work")).await.unwrap();
        ch.publish("work", b"job".to_vec(), MessageProperties::new()).await.unwrap();

        let mut consumer = ch.consume("work", ConsumeOptions::default()).await.unwrap();
        let _ = consumer.recv().await.unwrap();
        ch.close().await.unwrap();
        assert!(consumer.recv().await.is_none());

        let ch2 = conn.create_channel().await.unwrap();
        let mut consumer2 = ch2.consume("work", ConsumeOptions::default()).await.unwrap();
        let again = consumer2.recv().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, b"job".to_vec());
    }

    #[tokio::test]
    async fn publishing_to_unknown_queue_is_dropped() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.publish("nowhere", b"x".to_vec(), MessageProperties::new())
            .await
            .unwrap();
        assert!(!broker.queue_exists("nowhere"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_discarded() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue(&QueueConfig::durable("work")).await.unwrap();
        ch.publish(
            "work",
            b"stale".to_vec(),
            MessageProperties::new().with_expiration(Duration::from_millis(100)),
        )
        .await
        .unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;

        let stats = broker.queue_stats("work").unwrap();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test]
    async fn exclusive_queue_is_private_and_removed_with_its_connection() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        let name = ch.declare_queue(&QueueConfig::exclusive_reply()).await.unwrap();
        assert!(name.starts_with("amq.gen-"));

        let (_other_conn, other) = channel(&broker).await;
        let err = other
            .consume(&name, ConsumeOptions::no_ack())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::ResourceLocked(name.clone()));

        conn.close().await.unwrap();
        assert!(!broker.queue_exists(&name));
        assert!(!ch.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn unused_expiring_queue_is_removed() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        let name = ch
            .declare_queue(&QueueConfig::ephemeral_reply(Duration::from_millis(500)))
            .await
            .unwrap();
        let consumer = ch.consume(&name, ConsumeOptions::no_ack()).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(broker.queue_exists(&name), "queue in use must survive");

        ch.cancel(consumer.tag()).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!broker.queue_exists(&name));
    }

    #[tokio::test]
    async fn injected_connect_failures_are_consumed_in_order() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn redeclare_with_different_flags_fails() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue(&QueueConfig::durable("work")).await.unwrap();
        ch.declare_queue(&QueueConfig::durable("work")).await.unwrap();

        let mut transient = QueueConfig::durable("work");
        transient.durable = false;
        assert_eq!(
            ch.declare_queue(&transient).await.unwrap_err(),
            BrokerError::PreconditionFailed("work".to_string())
        );
    }
}
