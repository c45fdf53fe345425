//! idmef-relay entry point.
//!
//! Reads one event per line on standard input and broadcasts it through a
//! TCP connection pool configured from the environment. Pool events are
//! logged as JSON.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use idmef_relay::config::RelayConfig;
use idmef_relay::service::ConnectionPool;
use idmef_relay::transport::{Message, TcpConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    tracing::info!(
        topology = %config.connection_string,
        backup_dir = %config.backup_dir.display(),
        "starting idmef-relay"
    );

    // Build the pool
    let pool = ConnectionPool::with_event_capacity(
        TcpConnector::new(config.connect_timeout()),
        config.profile(),
        config.permission,
        config.event_bus_capacity,
    );
    pool.set_flags(config.pool_flags()).await;
    pool.set_connection_string(&config.connection_string)
        .await
        .context("cannot apply connection string")?;

    let mut events = pool.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!(event = %json, "pool event"),
                    Err(err) => tracing::warn!(error = %err, "cannot encode pool event"),
                },
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event logger lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    pool.init().await.context("cannot initialize connection pool")?;
    let driver = pool.spawn_driver()?;

    // Relay stdin until EOF or ctrl-c
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("cannot read standard input")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Message::idmef(line) {
                    Ok(msg) => pool.broadcast(&msg).await,
                    Err(err) => tracing::warn!(error = %err, "event rejected"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    tracing::info!(
        backlog = pool.global_backlog().await,
        "shutting down idmef-relay"
    );
    driver.abort();
    drop(pool);
    logger.abort();
    Ok(())
}
