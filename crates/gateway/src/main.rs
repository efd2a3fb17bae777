use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use courier_gateway::{Gateway, app};
use courier_infra::broker::RedisBroker;
use courier_infra::config::parse_var;
use courier_infra::{BrokerConnection, ConnectionRole, CourierConfig, RpcClient};

const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init_for("gateway");

    let config = CourierConfig::from_env()?;
    let lookup = |var: &str| std::env::var(var).ok();
    let addr: SocketAddr = parse_var(&lookup, "COURIER_GATEWAY_ADDR", DEFAULT_ADDR.parse()?)?;

    let broker = RedisBroker::new(&config.broker_url)?;
    let connection =
        BrokerConnection::with_policy(Arc::new(broker), ConnectionRole::Gateway, config.retry);
    let client = RpcClient::with_mode(connection.clone(), config.reply_mode);
    let gateway = Gateway::new(Arc::new(client));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, reply_mode = %config.reply_mode, "listening");

    axum::serve(listener, app::build_app(gateway)).await?;
    connection.close().await?;
    Ok(())
}
