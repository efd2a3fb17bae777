//! Typed calls into the worker fleet.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue, json};
use tracing::debug;

use courier_core::MessageKind;
use courier_infra::RpcClient;
use courier_messaging::QueueContract;

use crate::errors::GatewayError;

/// A worker service reachable through the gateway.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Service {
    Hash,
    Backup,
    Photo,
    Email,
}

impl Service {
    pub const ALL: [Service; 4] = [Service::Hash, Service::Backup, Service::Photo, Service::Email];

    pub fn as_str(self) -> &'static str {
        match self {
            Service::Hash => "hash",
            Service::Backup => "backup",
            Service::Photo => "photo",
            Service::Email => "email",
        }
    }

    pub fn contract(self) -> QueueContract {
        match self {
            Service::Hash => QueueContract::hash(),
            Service::Backup => QueueContract::backup(),
            Service::Photo => QueueContract::photo(),
            Service::Email => QueueContract::email(),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.as_str() == s)
            .ok_or_else(|| format!("unknown service '{s}'"))
    }
}

/// Gateway-side facade: one method per capability, each bound to its
/// service's queue contract and call class.
#[derive(Debug, Clone)]
pub struct Gateway {
    client: Arc<RpcClient>,
}

impl Gateway {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Liveness check; succeeds only on a `pong` answer.
    pub async fn ping(&self, service: Service) -> Result<(), GatewayError> {
        let response = self.call(service, MessageKind::Ping, None).await?;
        match response.as_str() {
            Some("pong") => Ok(()),
            _ => Err(unexpected(MessageKind::Ping, response)),
        }
    }

    pub async fn create_hash(&self, password: &str) -> Result<String, GatewayError> {
        let response = self
            .call(
                Service::Hash,
                MessageKind::CreateHash,
                Some(fields([("password", password)])),
            )
            .await?;
        expect_string(MessageKind::CreateHash, response)
    }

    pub async fn validate_hash(&self, known_hash: &str, attempt: &str) -> Result<bool, GatewayError> {
        let response = self
            .call(
                Service::Hash,
                MessageKind::ValidateHash,
                Some(fields([("known_hash", known_hash), ("attempt", attempt)])),
            )
            .await?;
        response
            .as_bool()
            .ok_or_else(|| unexpected(MessageKind::ValidateHash, response))
    }

    pub async fn full_backup(&self) -> Result<(), GatewayError> {
        self.backup(MessageKind::FullBackup).await
    }

    pub async fn sql_backup(&self) -> Result<(), GatewayError> {
        self.backup(MessageKind::SqlBackup).await
    }

    /// Returns the converted file's name.
    pub async fn convert_photo(&self, filename: &str) -> Result<String, GatewayError> {
        let response = self
            .call(
                Service::Photo,
                MessageKind::ConvertPhoto,
                Some(fields([("filename", filename)])),
            )
            .await?;
        expect_string(MessageKind::ConvertPhoto, response)
    }

    /// Fire-and-forget; delivery failures surface only in the email worker's logs.
    pub async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), GatewayError> {
        let data = fields([("to", to), ("subject", subject), ("body", body)]);
        self.client
            .notify(MessageKind::SendEmail, Some(data), Service::Email.contract().name())
            .await?;
        Ok(())
    }

    async fn backup(&self, kind: MessageKind) -> Result<(), GatewayError> {
        let response = self.call(Service::Backup, kind, None).await?;
        match response {
            JsonValue::Bool(true) => Ok(()),
            other => Err(unexpected(kind, other)),
        }
    }

    async fn call(
        &self,
        service: Service,
        kind: MessageKind,
        data: Option<Map<String, JsonValue>>,
    ) -> Result<JsonValue, GatewayError> {
        let response = self
            .client
            .call_contract(&service.contract(), kind, data)
            .await?;
        debug!(service = %service, kind = %kind, "call resolved");
        Ok(response)
    }
}

fn fields<const N: usize>(pairs: [(&str, &str); N]) -> Map<String, JsonValue> {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), json!(value)))
        .collect()
}

fn expect_string(kind: MessageKind, response: JsonValue) -> Result<String, GatewayError> {
    match response {
        JsonValue::String(value) => Ok(value),
        other => Err(unexpected(kind, other)),
    }
}

fn unexpected(kind: MessageKind, response: JsonValue) -> GatewayError {
    GatewayError::UnexpectedResponse { kind, response }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_infra::{BrokerConnection, CallError, ConnectionRole, RetryPolicy, WorkerHandle, WorkerServer};
    use courier_messaging::{HandlerRegistry, InMemoryBroker};

    use super::*;

    fn connection(broker: &InMemoryBroker, role: ConnectionRole) -> BrokerConnection {
        BrokerConnection::with_policy(
            Arc::new(broker.clone()),
            role,
            RetryPolicy::new(2, Duration::from_millis(5)),
        )
    }

    async fn worker(broker: &InMemoryBroker, service: Service, handlers: HandlerRegistry) -> WorkerHandle {
        let handle = WorkerServer::new(
            connection(broker, ConnectionRole::Worker),
            service.contract(),
            handlers,
        )
        .spawn();
        while broker
            .queue_stats(service.as_str())
            .map_or(0, |s| s.consumers)
            == 0
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle
    }

    fn gateway(broker: &InMemoryBroker) -> Gateway {
        Gateway::new(Arc::new(RpcClient::new(connection(
            broker,
            ConnectionRole::Gateway,
        ))))
    }

    #[test]
    fn service_names_round_trip() {
        for service in Service::ALL {
            assert_eq!(service.as_str().parse::<Service>(), Ok(service));
            assert_eq!(service.contract().name(), service.as_str());
        }
        assert!("sms".parse::<Service>().is_err());
    }

    #[tokio::test]
    async fn validate_hash_decodes_boolean_answers() {
        let broker = InMemoryBroker::new();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn(MessageKind::ValidateHash, |_, payload| async move {
            Ok(json!(payload.get("attempt") == payload.get("known_hash")))
        });
        let worker = worker(&broker, Service::Hash, handlers).await;
        let gateway = gateway(&broker);

        assert!(gateway.validate_hash("same", "same").await.unwrap());
        assert!(!gateway.validate_hash("same", "other").await.unwrap());
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wrongly_typed_answer_is_reported() {
        let broker = InMemoryBroker::new();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn(MessageKind::CreateHash, |_, _| async { Ok(json!(42)) });
        let worker = worker(&broker, Service::Hash, handlers).await;

        let err = gateway(&broker).create_hash("pw").await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::UnexpectedResponse {
                kind: MessageKind::CreateHash,
                response: json!(42),
            }
        );
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn backup_error_reply_becomes_a_call_error() {
        let broker = InMemoryBroker::new();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn(MessageKind::SqlBackup, |_, _| async {
            Err(courier_core::CapabilityError::external("pg_dump exited with status 1"))
        });
        let worker = worker(&broker, Service::Backup, handlers).await;

        let err = gateway(&broker).sql_backup().await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Call(CallError::Remote(
                "external failure: pg_dump exited with status 1".to_string()
            ))
        );
        worker.shutdown().await.unwrap();
    }
}
