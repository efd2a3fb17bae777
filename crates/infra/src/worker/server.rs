//! Worker loop: consume one queue, validate, dispatch, reply, ack.
//!
//! Per delivery, in order:
//!
//! 1. parse the body; unparseable bytes are acked and dropped (no reply is
//!    possible without a trusted envelope)
//! 2. validate kind, then payload; rejections become an `error` reply
//! 3. run the registered handler on its own task; failures and panics become
//!    an `error` reply
//! 4. publish exactly one reply to `reply_to`/`correlation_id` (skipped for
//!    notifications without `reply_to`)
//! 5. ack exactly once; deliveries are never rejected or requeued
//!
//! Prefetch is 1, so a worker holds at most one unacknowledged delivery.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::{CapabilityError, Envelope};
use courier_messaging::{
    BrokerError, Channel, ConsumeOptions, Consumer, Delivery, HandlerRegistry, MessageProperties,
    MessageValidator, QueueContract, RawEnvelope, redact,
};

use crate::connection::{BrokerConnection, ConnectionError};

/// Unacknowledged deliveries a worker channel may hold.
pub const WORKER_PREFETCH: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// The connection retry budget is spent; the process should exit.
    #[error("broker connection unrecoverable: {0}")]
    Unrecoverable(ConnectionError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("worker task failed: {0}")]
    Task(String),
}

impl WorkerError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, WorkerError::Unrecoverable(_))
    }
}

impl From<ConnectionError> for WorkerError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Broker(inner) => WorkerError::Broker(inner),
            exhausted @ ConnectionError::RetriesExhausted { .. } => WorkerError::Unrecoverable(exhausted),
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    /// Deliveries taken off the queue.
    pub processed: u64,
    /// Answered with a success reply.
    pub succeeded: u64,
    /// Answered with an `error` reply (validation or capability failure).
    pub failed: u64,
    /// Unparseable deliveries acked without a reply.
    pub dropped: u64,
}

/// Handle to control a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<JoinHandle<Result<(), WorkerError>>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the loop to stop.
    pub async fn shutdown(mut self) -> Result<(), WorkerError> {
        let _ = self.shutdown.send(()).await;
        match self.join.take() {
            Some(join) => join
                .await
                .unwrap_or_else(|e| Err(WorkerError::Task(e.to_string()))),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        *lock(&self.stats)
    }

    /// The loop exited on its own (broker loss).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Serves one queue contract with a handler table.
#[derive(Debug)]
pub struct WorkerServer {
    connection: BrokerConnection,
    contract: QueueContract,
    handlers: HandlerRegistry,
    validator: MessageValidator,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerServer {
    pub fn new(connection: BrokerConnection, contract: QueueContract, handlers: HandlerRegistry) -> Self {
        Self {
            connection,
            contract,
            handlers,
            validator: MessageValidator::default(),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn with_validator(mut self, validator: MessageValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn contract(&self) -> &QueueContract {
        &self.contract
    }

    pub fn stats(&self) -> WorkerStats {
        *lock(&self.stats)
    }

    /// Spawn the loop on the runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(async move {
            self.listen(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
        });
        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Serve until `shutdown` completes or the connection becomes unrecoverable.
    ///
    /// A lost channel is re-established through the connection's retry budget.
    pub async fn listen<S>(&self, shutdown: S) -> Result<(), WorkerError>
    where
        S: Future<Output = ()> + Send,
    {
        let queue = self.contract.name();
        for kind in self.contract.kinds() {
            if self.handlers.get(*kind).is_none() {
                warn!(queue = %queue, kind = %kind, "no handler registered; requests will get an error reply");
            }
        }

        tokio::pin!(shutdown);
        loop {
            let (channel, mut consumer) = match self.subscribe().await {
                Ok(subscription) => subscription,
                Err(WorkerError::Broker(e)) if e.is_channel_closed() => {
                    let delay = self.connection.policy().delay;
                    warn!(queue = %queue, error = %e, delay_ms = delay.as_millis() as u64, "worker cannot subscribe; retrying");
                    self.connection.invalidate().await;
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!(queue = %queue, "worker stopped before subscribing");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "worker cannot subscribe");
                    return Err(e);
                }
            };
            info!(queue = %queue, prefetch = WORKER_PREFETCH, "worker listening");

            let lost = loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => {
                        let _ = channel.cancel(consumer.tag()).await;
                        info!(queue = %queue, stats = ?self.stats(), "worker stopped");
                        return Ok(());
                    }
                    next = consumer.recv() => match next {
                        Some(delivery) => {
                            if let Err(e) = self.process(&channel, delivery).await {
                                break e;
                            }
                        }
                        None => break BrokerError::ChannelClosed,
                    },
                }
            };

            warn!(queue = %queue, error = %lost, "worker lost its channel; reconnecting");
            self.connection.invalidate().await;
        }
    }

    async fn subscribe(&self) -> Result<(Arc<dyn Channel>, Consumer), WorkerError> {
        let channel = self.connection.get_channel().await?;
        let queue = channel.declare_queue(&self.contract.queue_config()).await?;
        channel.set_prefetch(WORKER_PREFETCH).await?;
        let consumer = channel.consume(&queue, ConsumeOptions::default()).await?;
        Ok((channel, consumer))
    }

    /// Handle one delivery end to end. Errors mean the channel is unusable.
    async fn process(&self, channel: &Arc<dyn Channel>, delivery: Delivery) -> Result<(), BrokerError> {
        let queue = self.contract.name();
        let tag = delivery.delivery_tag;
        self.record(|s| s.processed += 1);

        let Some(raw) = self.validator.parse(&delivery.body) else {
            warn!(queue = %queue, delivery_tag = %tag, bytes = delivery.body.len(), "unparseable message dropped");
            self.record(|s| s.dropped += 1);
            return channel.ack(tag).await;
        };

        let reply = self.reply_for(raw).await;
        if reply.is_error() {
            self.record(|s| s.failed += 1);
        } else {
            self.record(|s| s.succeeded += 1);
        }

        match delivery.properties.reply_to.as_deref() {
            Some(reply_to) => {
                let properties = MessageProperties {
                    correlation_id: delivery.properties.correlation_id.clone(),
                    ..MessageProperties::default()
                };
                if let Err(e) = channel.publish(reply_to, reply.to_bytes(), properties).await {
                    error!(queue = %queue, reply_to = %reply_to, error = %e, "failed to publish reply");
                    if e.is_channel_closed() {
                        return Err(e);
                    }
                }
            }
            None => debug!(queue = %queue, kind = %reply.kind(), "no reply requested"),
        }

        channel.ack(tag).await
    }

    /// Validate and dispatch; every outcome is a reply envelope.
    async fn reply_for(&self, raw: RawEnvelope) -> Envelope {
        let queue = self.contract.name();
        let message = match self.validator.validate(&raw, &self.contract) {
            Ok(message) => message,
            Err(e) => {
                warn!(queue = %queue, error = %e, "invalid message rejected");
                return Envelope::failure(e.to_string());
            }
        };

        let kind = message.kind;
        let Some(handler) = self.handlers.get(kind) else {
            let err = CapabilityError::Unhandled(kind.to_string());
            warn!(queue = %queue, kind = %kind, "no handler registered");
            return Envelope::failure(err.to_string());
        };

        debug!(queue = %queue, kind = %kind, payload = ?redact(&message.payload), "dispatching");
        let payload = message.payload;
        let task = tokio::spawn(async move { handler.handle(kind, payload).await });

        match task.await {
            Ok(Ok(response)) => {
                debug!(queue = %queue, kind = %kind, "capability succeeded");
                Envelope::success(kind, response)
            }
            Ok(Err(e)) => {
                warn!(queue = %queue, kind = %kind, error = %e, "capability failed");
                Envelope::failure(e.to_string())
            }
            Err(join) => {
                let reason = if join.is_panic() { "handler panicked" } else { "handler cancelled" };
                error!(queue = %queue, kind = %kind, reason, "capability task aborted");
                Envelope::failure(CapabilityError::Aborted(reason.to_string()).to_string())
            }
        }
    }

    fn record(&self, update: impl FnOnce(&mut WorkerStats)) {
        update(&mut *lock(&self.stats));
    }
}

fn lock(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
