//! RPC client: publish a request, wait for the correlated reply or time out.
//!
//! ## Call lifecycle
//!
//! ```text
//! CREATED ──publish──▶ AWAITING_REPLY ──┬─ reply (kind != error) ─▶ RESOLVED
//!                                        ├─ reply (kind == error) ─▶ REJECTED_BY_WORKER
//!                                        └─ ttl elapsed ──────────▶ TIMED_OUT
//! ```
//!
//! Each call settles exactly once. In shared mode the pending entry is removed
//! by whichever side wins (router or timer) and the other side finds nothing
//! to settle; a reply arriving after the timeout is dropped. In per-call mode
//! the reply queue is cancelled and deleted as soon as the call settles.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use courier_core::{CorrelationId, Envelope, MessageKind, QueueConfig};
use courier_messaging::{Channel, ConsumeOptions, Consumer, MessageProperties, QueueContract};

use super::pending::PendingCalls;
use super::{CallError, ReplyMode};
use crate::connection::BrokerConnection;

/// Build the `data` object actually published for `kind`.
///
/// Parameterless kinds never carry `data`; other kinds lose their
/// caller-side internal fields.
pub fn shape_payload(
    kind: MessageKind,
    payload: Option<Map<String, JsonValue>>,
) -> Option<Map<String, JsonValue>> {
    let profile = kind.profile();
    if !profile.carries_payload {
        return None;
    }
    payload.map(|mut data| {
        for field in profile.internal_fields {
            data.remove(*field);
        }
        data
    })
}

struct SharedReplies {
    queue: String,
    channel: Arc<dyn Channel>,
    pending: Arc<PendingCalls>,
    router: JoinHandle<()>,
}

impl SharedReplies {
    fn is_usable_on(&self, channel: &Arc<dyn Channel>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.channel), Arc::as_ptr(channel))
            && self.channel.is_open()
            && !self.router.is_finished()
    }
}

/// Caller side of request/reply.
///
/// Cheap to share behind an `Arc`; concurrent calls share one channel and
/// never resolve each other.
pub struct RpcClient {
    connection: BrokerConnection,
    mode: ReplyMode,
    shared: Mutex<Option<SharedReplies>>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("mode", &self.mode)
            .field("connection", &self.connection)
            .finish()
    }
}

impl RpcClient {
    pub fn new(connection: BrokerConnection) -> Self {
        Self::with_mode(connection, ReplyMode::default())
    }

    pub fn with_mode(connection: BrokerConnection, mode: ReplyMode) -> Self {
        Self {
            connection,
            mode,
            shared: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> ReplyMode {
        self.mode
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// Send `kind` to `queue` and wait up to `ttl` for the correlated reply.
    ///
    /// Resolves with the reply's `data.response`; an `error` reply becomes
    /// [`CallError::Remote`] carrying the worker's text.
    #[instrument(
        skip(self, payload),
        fields(kind = %kind, queue = %queue, ttl_ms = ttl.as_millis() as u64, mode = %self.mode),
        err
    )]
    pub async fn call(
        &self,
        kind: MessageKind,
        payload: Option<Map<String, JsonValue>>,
        queue: &str,
        ttl: Duration,
    ) -> Result<JsonValue, CallError> {
        let channel = self.connection.get_channel().await?;
        let body = Envelope::new(kind, shape_payload(kind, payload)).to_bytes();
        let id = CorrelationId::new();

        match self.mode {
            ReplyMode::Shared => self.call_shared(&channel, &id, queue, body, ttl).await,
            ReplyMode::PerCall => call_per_call(&channel, &id, queue, body, ttl).await,
        }
    }

    /// [`call`](Self::call) using a queue contract's name and call class.
    pub async fn call_contract(
        &self,
        contract: &QueueContract,
        kind: MessageKind,
        payload: Option<Map<String, JsonValue>>,
    ) -> Result<JsonValue, CallError> {
        self.call(kind, payload, contract.name(), contract.call_class().ttl())
            .await
    }

    /// Publish a one-way message; no reply is requested or awaited.
    #[instrument(skip(self, payload), fields(kind = %kind, queue = %queue), err)]
    pub async fn notify(
        &self,
        kind: MessageKind,
        payload: Option<Map<String, JsonValue>>,
        queue: &str,
    ) -> Result<(), CallError> {
        let channel = self.connection.get_channel().await?;
        let body = Envelope::new(kind, shape_payload(kind, payload)).to_bytes();
        channel.publish(queue, body, MessageProperties::new()).await?;
        debug!("notification published");
        Ok(())
    }

    /// Calls currently waiting on the shared reply queue.
    pub async fn pending_calls(&self) -> usize {
        self.shared
            .lock()
            .await
            .as_ref()
            .map_or(0, |shared| shared.pending.len())
    }

    async fn call_shared(
        &self,
        channel: &Arc<dyn Channel>,
        id: &CorrelationId,
        queue: &str,
        body: Vec<u8>,
        ttl: Duration,
    ) -> Result<JsonValue, CallError> {
        let (reply_queue, pending) = self.shared_reply_queue(channel).await?;
        let (_guard, reply) = pending.register(id);

        let properties = MessageProperties::new()
            .with_reply_to(reply_queue)
            .with_correlation_id(id.as_str())
            .with_expiration(ttl);
        channel.publish(queue, body, properties).await?;
        debug!(correlation_id = %id, "request published");

        match tokio::time::timeout(ttl, reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::ReplyChannelLost),
            Err(_) => {
                warn!(correlation_id = %id, "call timed out");
                Err(CallError::Timeout {
                    queue: queue.to_string(),
                    ttl,
                })
            }
        }
    }

    /// Reply queue and routing table bound to `channel`, declared on first use.
    async fn shared_reply_queue(
        &self,
        channel: &Arc<dyn Channel>,
    ) -> Result<(String, Arc<PendingCalls>), CallError> {
        let mut shared = self.shared.lock().await;
        if let Some(current) = shared.as_ref() {
            if current.is_usable_on(channel) {
                return Ok((current.queue.clone(), Arc::clone(&current.pending)));
            }
        }

        let queue = channel.declare_queue(&QueueConfig::exclusive_reply()).await?;
        let consumer = channel.consume(&queue, ConsumeOptions::no_ack()).await?;
        let pending = Arc::new(PendingCalls::default());
        let router = tokio::spawn(route_replies(consumer, Arc::clone(&pending), queue.clone()));
        debug!(reply_queue = %queue, "shared reply queue ready");

        *shared = Some(SharedReplies {
            queue: queue.clone(),
            channel: Arc::clone(channel),
            pending: Arc::clone(&pending),
            router,
        });
        Ok((queue, pending))
    }
}

/// Deliver replies from the shared queue to their waiting calls.
async fn route_replies(mut consumer: Consumer, pending: Arc<PendingCalls>, queue: String) {
    while let Some(delivery) = consumer.recv().await {
        let Some(id) = delivery.properties.correlation_id.as_deref() else {
            debug!(reply_queue = %queue, "reply without correlation id ignored");
            continue;
        };
        if !pending.settle(id, decode_reply(&delivery.body)) {
            debug!(reply_queue = %queue, correlation_id = %id, "late or unknown reply dropped");
        }
    }

    let failed = pending.fail_all(CallError::ReplyChannelLost);
    warn!(reply_queue = %queue, failed, "reply consumer stopped");
}

async fn call_per_call(
    channel: &Arc<dyn Channel>,
    id: &CorrelationId,
    queue: &str,
    body: Vec<u8>,
    ttl: Duration,
) -> Result<JsonValue, CallError> {
    let reply_queue = channel.declare_queue(&QueueConfig::ephemeral_reply(ttl)).await?;
    let mut consumer = match channel.consume(&reply_queue, ConsumeOptions::no_ack()).await {
        Ok(consumer) => consumer,
        Err(e) => {
            let _ = channel.delete_queue(&reply_queue).await;
            return Err(e.into());
        }
    };

    let outcome = await_private_reply(channel, &mut consumer, id, queue, body, &reply_queue, ttl).await;

    // The reply destination never outlives the call.
    let _ = channel.cancel(consumer.tag()).await;
    let _ = channel.delete_queue(&reply_queue).await;
    outcome
}

async fn await_private_reply(
    channel: &Arc<dyn Channel>,
    consumer: &mut Consumer,
    id: &CorrelationId,
    queue: &str,
    body: Vec<u8>,
    reply_queue: &str,
    ttl: Duration,
) -> Result<JsonValue, CallError> {
    let properties = MessageProperties::new()
        .with_reply_to(reply_queue)
        .with_correlation_id(id.as_str())
        .with_expiration(ttl);
    channel.publish(queue, body, properties).await?;
    debug!(correlation_id = %id, reply_queue = %reply_queue, "request published");

    let wait = async {
        loop {
            match consumer.recv().await {
                Some(delivery) if delivery.properties.correlation_id.as_deref() == Some(id.as_str()) => {
                    return decode_reply(&delivery.body);
                }
                Some(_) => debug!(correlation_id = %id, "reply with foreign correlation id ignored"),
                None => return Err(CallError::ReplyChannelLost),
            }
        }
    };

    match tokio::time::timeout(ttl, wait).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(correlation_id = %id, "call timed out");
            Err(CallError::Timeout {
                queue: queue.to_string(),
                ttl,
            })
        }
    }
}

/// Map a reply body to the call outcome.
fn decode_reply(body: &[u8]) -> Result<JsonValue, CallError> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| CallError::MalformedReply(format!("undecodable reply: {e}")))?;

    if envelope.is_error() {
        return match envelope.error_text() {
            Some(text) => Err(CallError::Remote(text.to_string())),
            None => Err(CallError::MalformedReply("error reply without text".to_string())),
        };
    }
    envelope
        .response()
        .cloned()
        .ok_or_else(|| CallError::MalformedReply("success reply without data.response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionRole, RetryPolicy};
    use courier_messaging::{Broker, InMemoryBroker};
    use serde_json::json;

    const TTL: Duration = Duration::from_millis(1500);

    fn client(broker: &InMemoryBroker, mode: ReplyMode) -> RpcClient {
        let connection = BrokerConnection::with_policy(
            Arc::new(broker.clone()),
            ConnectionRole::Gateway,
            RetryPolicy::new(2, Duration::from_millis(10)),
        );
        RpcClient::with_mode(connection, mode)
    }

    /// Minimal responder: answers each request on `queue` with `respond(body)`.
    async fn responder<F>(broker: &InMemoryBroker, queue: &str, respond: F) -> Arc<dyn Channel>
    where
        F: Fn(JsonValue) -> Option<Vec<u8>> + Send + 'static,
    {
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_queue(&QueueConfig::durable(queue)).await.unwrap();
        let mut consumer = channel
            .consume(queue, ConsumeOptions::default())
            .await
            .unwrap();
        let worker = Arc::clone(&channel);
        tokio::spawn(async move {
            let _connection = connection;
            while let Some(delivery) = consumer.recv().await {
                let request: JsonValue = serde_json::from_slice(&delivery.body).unwrap();
                if let (Some(body), Some(reply_to)) = (respond(request), delivery.properties.reply_to.clone()) {
                    let mut props = MessageProperties::new();
                    props.correlation_id = delivery.properties.correlation_id.clone();
                    worker.publish(&reply_to, body, props).await.unwrap();
                }
                worker.ack(delivery.delivery_tag).await.unwrap();
            }
        });
        channel
    }

    fn echo(request: JsonValue) -> Option<Vec<u8>> {
        let kind: MessageKind = serde_json::from_value(request["kind"].clone()).unwrap();
        Some(Envelope::success(kind, request["data"].clone()).to_bytes())
    }

    #[test]
    fn parameterless_kinds_drop_caller_data() {
        let mut data = Map::new();
        data.insert("ignored".into(), json!(1));
        assert_eq!(shape_payload(MessageKind::Ping, Some(data.clone())), None);
        assert_eq!(shape_payload(MessageKind::FullBackup, Some(data)), None);
    }

    #[test]
    fn internal_fields_are_stripped() {
        let mut data = Map::new();
        data.insert("password".into(), json!("abc123456789"));
        data.insert("correlation_id".into(), json!("caller-side"));
        let shaped = shape_payload(MessageKind::CreateHash, Some(data)).unwrap();
        assert_eq!(shaped.len(), 1);
        assert!(shaped.contains_key("password"));
    }

    #[tokio::test]
    async fn round_trip_in_both_modes() {
        for mode in [ReplyMode::Shared, ReplyMode::PerCall] {
            let broker = InMemoryBroker::new();
            responder(&broker, "echo", echo).await;
            let client = client(&broker, mode);

            let mut data = Map::new();
            data.insert("to".into(), json!("ops@example.com"));
            let response = client
                .call(MessageKind::SendEmail, Some(data), "echo", TTL)
                .await
                .unwrap();
            assert_eq!(response, json!({"to": "ops@example.com"}), "{mode}");
        }
    }

    #[tokio::test]
    async fn ping_is_sent_without_data() {
        let broker = InMemoryBroker::new();
        responder(&broker, "echo", |request| {
            assert!(request.get("data").is_none());
            Some(Envelope::success(MessageKind::Ping, json!("pong")).to_bytes())
        })
        .await;
        let client = client(&broker, ReplyMode::Shared);

        let mut junk = Map::new();
        junk.insert("junk".into(), json!(true));
        let response = client.call(MessageKind::Ping, Some(junk), "echo", TTL).await.unwrap();
        assert_eq!(response, json!("pong"));
    }

    #[tokio::test]
    async fn error_reply_rejects_with_worker_text() {
        let broker = InMemoryBroker::new();
        responder(&broker, "hash", |_| Some(Envelope::failure("\"password\" is required").to_bytes())).await;
        let client = client(&broker, ReplyMode::Shared);

        let err = client
            .call(MessageKind::CreateHash, Some(Map::new()), "hash", TTL)
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Remote("\"password\" is required".to_string()));
    }

    #[tokio::test]
    async fn malformed_replies_reject_instead_of_hanging() {
        let broker = InMemoryBroker::new();
        responder(&broker, "odd", |_| Some(br#"{"kind":"ping"}"#.to_vec())).await;
        let client = client(&broker, ReplyMode::Shared);
        let err = client.call(MessageKind::Ping, None, "odd", TTL).await.unwrap_err();
        assert!(matches!(err, CallError::MalformedReply(_)));

        let broker = InMemoryBroker::new();
        responder(&broker, "odd", |_| Some(b"not json".to_vec())).await;
        let client = self::client(&broker, ReplyMode::PerCall);
        let err = client.call(MessageKind::Ping, None, "odd", TTL).await.unwrap_err();
        assert!(matches!(err, CallError::MalformedReply(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_at_the_ttl() {
        for mode in [ReplyMode::Shared, ReplyMode::PerCall] {
            let broker = InMemoryBroker::new();
            responder(&broker, "backup", |_| None).await;
            let client = client(&broker, mode);

            let started = tokio::time::Instant::now();
            let err = client
                .call(MessageKind::FullBackup, None, "backup", Duration::from_millis(20_000))
                .await
                .unwrap_err();
            let elapsed = started.elapsed();
            assert_eq!(
                err,
                CallError::Timeout {
                    queue: "backup".to_string(),
                    ttl: Duration::from_millis(20_000)
                }
            );
            assert!(elapsed >= Duration::from_millis(20_000));
            assert!(elapsed < Duration::from_millis(20_100));
            assert_eq!(client.pending_calls().await, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_correlation_ids_are_ignored() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_queue(&QueueConfig::durable("hash")).await.unwrap();
        let mut consumer = channel.consume("hash", ConsumeOptions::no_ack()).await.unwrap();
        let imposter = Arc::clone(&channel);
        tokio::spawn(async move {
            let _connection = connection;
            while let Some(delivery) = consumer.recv().await {
                let reply_to = delivery.properties.reply_to.clone().unwrap();
                let props = MessageProperties::new().with_correlation_id("not-yours");
                let body = Envelope::success(MessageKind::CreateHash, json!("forged")).to_bytes();
                imposter.publish(&reply_to, body, props).await.unwrap();
            }
        });

        for mode in [ReplyMode::Shared, ReplyMode::PerCall] {
            let client = client(&broker, mode);
            let err = client.call(MessageKind::Ping, None, "hash", TTL).await.unwrap_err();
            assert!(err.is_timeout(), "{mode}: {err}");
        }
    }

    #[tokio::test]
    async fn per_call_reply_queue_is_removed_after_settling() {
        let broker = InMemoryBroker::new();
        responder(&broker, "echo", echo).await;
        let client = client(&broker, ReplyMode::PerCall);

        client.call(MessageKind::Ping, None, "echo", TTL).await.unwrap();
        assert_eq!(broker.queue_names(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn shared_reply_queue_is_reused() {
        let broker = InMemoryBroker::new();
        responder(&broker, "echo", echo).await;
        let client = client(&broker, ReplyMode::Shared);

        for _ in 0..3 {
            client.call(MessageKind::Ping, None, "echo", TTL).await.unwrap();
        }
        assert_eq!(broker.queue_names().len(), 2);
        assert_eq!(client.pending_calls().await, 0);
    }

    #[tokio::test]
    async fn losing_the_reply_consumer_rejects_outstanding_calls() {
        let broker = InMemoryBroker::new();
        // Requests are received but never answered.
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_queue(&QueueConfig::durable("photo")).await.unwrap();

        let client = Arc::new(client(&broker, ReplyMode::Shared));
        let call = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .call(MessageKind::Ping, None, "photo", Duration::from_secs(30))
                    .await
            })
        };
        while broker.queue_stats("photo").map_or(0, |s| s.ready) == 0 {
            tokio::task::yield_now().await;
        }

        broker.disconnect_all();
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, CallError::ReplyChannelLost);

        // The next call re-establishes the reply queue on a fresh channel.
        responder(&broker, "echo", echo).await;
        assert_eq!(
            client.call(MessageKind::Ping, None, "echo", TTL).await.unwrap(),
            json!(null)
        );
    }

    #[tokio::test]
    async fn notify_publishes_without_reply_properties() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_queue(&QueueConfig::durable("email")).await.unwrap();
        let mut consumer = channel.consume("email", ConsumeOptions::no_ack()).await.unwrap();

        let client = client(&broker, ReplyMode::Shared);
        let mut data = Map::new();
        data.insert("to".into(), json!("ops@example.com"));
        data.insert("correlation_id".into(), json!("x"));
        client.notify(MessageKind::SendEmail, Some(data), "email").await.unwrap();

        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery.properties, MessageProperties::new());
        let body: JsonValue = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(body, json!({"kind": "send-email", "data": {"to": "ops@example.com"}}));
    }

    #[tokio::test]
    async fn unreachable_broker_surfaces_connection_error() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);
        let client = client(&broker, ReplyMode::Shared);
        let err = client.call(MessageKind::Ping, None, "hash", TTL).await.unwrap_err();
        assert!(matches!(err, CallError::Connection(_)));
        assert!(err.is_transport());
    }
}
