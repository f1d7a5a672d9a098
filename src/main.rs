//! WebSocket Event Relay - Entry Point
//!
//! Provisions the room topic, builds the relay routes, and accepts connections.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_relay::sink::ReplyErrorSink;
use chat_relay::{relay, BrokerAdapter, BrokerLedger, Dispatcher, MemoryBroker, RelayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let mut config = RelayConfig::from_env()?;

    // Bind address from command line overrides the environment
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr;
    }

    let broker = MemoryBroker::new();
    let admin = broker.create_admin().await?;
    admin
        .create_topic(&config.room_topic, config.room_partitions)
        .await?;
    admin.destroy().await?;

    let ledger = Arc::new(BrokerLedger::with_retry(
        Arc::new(broker),
        config.retry.clone(),
    ));

    let dispatcher = Dispatcher::new(relay::routes(ledger.clone(), &config.room_topic))
        .with_sink(Arc::new(ReplyErrorSink::new(config.close_on_client_error)))
        .with_outbound_buffer(config.outbound_buffer);

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("WebSocket relay listening on {}", config.bind_addr);

    tokio::select! {
        result = dispatcher.serve(listener) => {
            if let Err(e) = result {
                error!("Dispatcher stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    ledger.shutdown().await;
    Ok(())
}
