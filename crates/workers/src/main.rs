use std::sync::Arc;

use anyhow::Context;

use courier_infra::broker::RedisBroker;
use courier_infra::{BrokerConnection, ConnectionRole, WorkerServer};
use courier_messaging::MessageValidator;
use courier_workers::{WorkerConfig, handlers_for};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    courier_observability::init_for(config.service.as_str());

    let broker = RedisBroker::new(&config.courier.broker_url)
        .with_context(|| format!("invalid broker url {}", config.courier.broker_url))?;
    let connection =
        BrokerConnection::with_policy(Arc::new(broker), ConnectionRole::Worker, config.courier.retry);

    let server = WorkerServer::new(
        connection.clone(),
        config.service.contract(),
        handlers_for(&config),
    )
    .with_validator(MessageValidator::new().with_max_envelope_bytes(config.courier.max_envelope_bytes));

    // An unrecoverable connection ends `listen` with an error and a non-zero exit.
    server
        .listen(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    connection.close().await?;
    Ok(())
}
