use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use forward_relay::{RelayConfig, SmtpServer, build_services, init_tracing, shutdown_signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config_path = std::env::var("RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("relay.toml"));

    let config = RelayConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        environment = ?config.environment,
        listen_addr = %config.listen_addr,
        "starting forward-relay"
    );

    let services = build_services(config).context("failed to initialize relay services")?;

    let shutdown = CancellationToken::new();
    let server = SmtpServer::new(services, shutdown.clone());
    server.spawn();

    shutdown_signal(shutdown.clone()).await;
    shutdown.cancel();

    // give the connection loop time to notice cancellation and wind down
    tokio::time::sleep(Duration::from_secs(1)).await;

    Ok(())
}
