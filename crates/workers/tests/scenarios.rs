//! Gateway-to-worker scenarios over the in-process broker with the real
//! capability services.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value as JsonValue, json};

use courier_core::{CallClass, MessageKind};
use courier_infra::{BrokerConnection, CallError, ConnectionRole, RetryPolicy, RpcClient, WorkerHandle, WorkerServer};
use courier_messaging::{HandlerRegistry, InMemoryBroker, QueueContract};
use courier_workers::{
    BackupScripts, BackupService, HashCost, HashService, ImageConverter, PhotoHandler,
};

fn connection(broker: &InMemoryBroker, role: ConnectionRole) -> BrokerConnection {
    BrokerConnection::with_policy(
        Arc::new(broker.clone()),
        role,
        RetryPolicy::new(3, Duration::from_millis(10)),
    )
}

async fn start(broker: &InMemoryBroker, contract: QueueContract, handlers: HandlerRegistry) -> WorkerHandle {
    let queue = contract.name().to_string();
    let worker = WorkerServer::new(connection(broker, ConnectionRole::Worker), contract, handlers).spawn();
    while broker.queue_stats(&queue).map_or(0, |s| s.consumers) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    worker
}

fn data(pairs: &[(&str, &str)]) -> Option<Map<String, JsonValue>> {
    Some(pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect())
}

fn hash_service() -> HashService {
    HashService::with_cost(HashCost::MINIMAL).unwrap()
}

#[tokio::test]
async fn every_service_answers_ping_within_the_short_class() {
    let broker = InMemoryBroker::new();
    let scripts = BackupScripts {
        full: PathBuf::from("true"),
        sql: PathBuf::from("true"),
    };
    let workers = vec![
        start(&broker, QueueContract::hash(), hash_service().handlers()).await,
        start(&broker, QueueContract::backup(), BackupService::new(scripts).handlers()).await,
        start(
            &broker,
            QueueContract::photo(),
            PhotoHandler::new(Arc::new(ImageConverter::new(
                std::env::temp_dir(),
                image::ImageFormat::WebP,
            )))
            .handlers(),
        )
        .await,
        start(&broker, QueueContract::email(), HandlerRegistry::new()).await,
    ];
    let client = RpcClient::new(connection(&broker, ConnectionRole::Gateway));

    for queue in ["hash", "backup", "photo", "email"] {
        let started = Instant::now();
        let response = client
            .call(MessageKind::Ping, None, queue, CallClass::Short.ttl())
            .await;
        assert_eq!(response, Ok(json!("pong")), "{queue}");
        assert!(started.elapsed() < Duration::from_millis(1500), "{queue}");
    }

    for worker in workers {
        worker.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn create_then_validate_hash() {
    let broker = InMemoryBroker::new();
    let worker = start(&broker, QueueContract::hash(), hash_service().handlers()).await;
    let client = RpcClient::new(connection(&broker, ConnectionRole::Gateway));
    let contract = QueueContract::hash();

    let hash = client
        .call_contract(&contract, MessageKind::CreateHash, data(&[("password", "hunter2")]))
        .await
        .unwrap();
    let hash = hash.as_str().unwrap().to_string();
    assert!(hash.starts_with("$argon2id$"));

    let valid = client
        .call_contract(
            &contract,
            MessageKind::ValidateHash,
            data(&[("known_hash", hash.as_str()), ("attempt", "hunter2")]),
        )
        .await;
    assert_eq!(valid, Ok(json!(true)));

    let invalid = client
        .call_contract(
            &contract,
            MessageKind::ValidateHash,
            data(&[("known_hash", hash.as_str()), ("attempt", "hunter3")]),
        )
        .await;
    assert_eq!(invalid, Ok(json!(false)));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_password_is_rejected_before_hashing() {
    let broker = InMemoryBroker::new();
    let worker = start(&broker, QueueContract::hash(), hash_service().handlers()).await;
    let client = RpcClient::new(connection(&broker, ConnectionRole::Gateway));

    let err = client
        .call_contract(&QueueContract::hash(), MessageKind::CreateHash, data(&[("password", "")]))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Remote(ref msg) if msg.contains("\"password\"")), "{err}");
    assert_eq!(worker.stats().succeeded, 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_backup_script_is_reported_to_the_caller() {
    let broker = InMemoryBroker::new();
    let scripts = BackupScripts {
        full: PathBuf::from("true"),
        sql: PathBuf::from("false"),
    };
    let worker = start(&broker, QueueContract::backup(), BackupService::new(scripts).handlers()).await;
    let client = RpcClient::new(connection(&broker, ConnectionRole::Gateway));
    let contract = QueueContract::backup();

    assert_eq!(
        client.call_contract(&contract, MessageKind::FullBackup, None).await,
        Ok(json!(true))
    );
    assert_eq!(
        client.call_contract(&contract, MessageKind::SqlBackup, None).await,
        Err(CallError::Remote(
            "external failure: false exited with status 1".to_string()
        ))
    );

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_photo_is_reported_to_the_caller() {
    let broker = InMemoryBroker::new();
    let upload_dir = std::env::temp_dir().join(format!("courier-uploads-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&upload_dir).unwrap();
    let converter = ImageConverter::new(&upload_dir, image::ImageFormat::WebP);
    let worker = start(&broker, QueueContract::photo(), PhotoHandler::new(Arc::new(converter)).handlers()).await;
    let client = RpcClient::new(connection(&broker, ConnectionRole::Gateway));

    let err = client
        .call_contract(&QueueContract::photo(), MessageKind::ConvertPhoto, data(&[("filename", "ghost.png")]))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Remote(ref msg) if msg.starts_with("not found:")), "{err}");

    worker.shutdown().await.unwrap();
    std::fs::remove_dir_all(upload_dir).unwrap();
}
