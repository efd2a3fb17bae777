//! Broker transport abstraction (mechanics only).
//!
//! This module provides the **queue broker pattern** used by every service: named
//! queues, point-to-point delivery to one consumer, explicit acknowledgement, and
//! per-channel prefetch limits.
//!
//! ## Design Philosophy
//!
//! The abstraction is intentionally **thin** and mirrors the primitives an
//! AMQP-style broker exposes:
//!
//! - **Connection → Channel**: one connection per process, channels opened on it
//! - **Queues**: declared idempotently (durable, exclusive, TTL, expiry)
//! - **At-least-once delivery**: unacknowledged deliveries are redelivered when
//!   their channel closes
//! - **Prefetch**: a channel holds at most `prefetch` unacknowledged deliveries;
//!   further deliveries are withheld until an ack frees a slot
//! - **Default exchange**: publishing to a queue that does not exist silently
//!   drops the message (this is how late replies to expired reply queues vanish)
//!
//! ## Why Trait Objects?
//!
//! The RPC client, the worker loop and the connection manager only need these
//! operations, so they hold `Arc<dyn Channel>` and stay testable against the
//! in-process [`InMemoryBroker`](crate::InMemoryBroker) while production wires a
//! networked implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use courier_core::{DeliveryTag, QueueConfig};

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("queue '{0}' is exclusive to another connection")]
    ResourceLocked(String),

    #[error("queue '{0}' redeclared with different arguments")]
    PreconditionFailed(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// The channel (or its connection) is gone and must be re-established.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed | BrokerError::ConnectionClosed)
    }
}

/// Message properties the substrate relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Queue the receiver should publish its reply to.
    pub reply_to: Option<String>,
    /// Caller-chosen token that must round-trip unchanged.
    pub correlation_id: Option<String>,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_correlation_id(mut self, token: impl Into<String>) -> Self {
        self.correlation_id = Some(token.into());
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Set when the message was requeued after its previous channel closed.
    pub redelivered: bool,
}

/// Consumer options.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged on hand-off (no `ack` call expected).
    pub no_ack: bool,
}

impl ConsumeOptions {
    pub fn no_ack() -> Self {
        Self { no_ack: true }
    }
}

/// A stream of deliveries for one consumer.
///
/// `recv` returns `None` once the consumer is cancelled, its queue is deleted,
/// or its channel closes.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn new(tag: impl Into<String>, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            tag: tag.into(),
            receiver,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Wait for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Take a delivery if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

/// Entry point to a broker: produces connections.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        (**self).connect().await
    }
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Close every channel on the connection, then the connection itself.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// Channel-level operations.
///
/// All operations are safe to issue concurrently from multiple tasks.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue and return its (possibly broker-generated) name.
    async fn declare_queue(&self, config: &QueueConfig) -> Result<String, BrokerError>;

    /// Limit unacknowledged deliveries held by this channel (`0` = unlimited).
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Close the channel; unacknowledged deliveries are requeued.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}
