//! Chat fan-out hub - Entry Point
//!
//! Starts the TCP listener and the hub actor, accepting WebSocket
//! connections against an in-process store.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_hub::{handle_connection, ChatStore, Config, Hub, MemoryStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_hub=info")),
        )
        .init();

    let config = Config::from_env();

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("chat hub listening on {}", config.bind_addr);

    // Start the hub actor
    let (hub, actor) = Hub::channel();
    tokio::spawn(actor.run());
    info!("hub actor started");

    // In-process store; the production deployment substitutes the
    // SQL-backed collaborator behind the same trait.
    let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("new connection from {}", addr);
                let hub = hub.clone();
                let store = Arc::clone(&store);

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, hub, store).await {
                        error!("connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}
