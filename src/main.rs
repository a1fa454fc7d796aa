//! Real-time Channel Fan-out Server - Entry Point
//!
//! Loads settings, starts the TCP listener and accepts WebSocket
//! connections until Ctrl-C, then closes every connection.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chat_fanout::{
    handle_connection, AppError, ChatServer, InMemoryMembership, InMemoryMessageStore, Settings,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_fanout=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_fanout=info")),
        )
        .init();

    let settings = Settings::load()?;
    info!(
        addr = %settings.server_addr(),
        environment = %settings.environment,
        queue_capacity = settings.realtime.outbound_queue_capacity,
        "Configuration loaded"
    );

    // External collaborators; in-memory stand-ins for this standalone binary
    let membership = Arc::new(InMemoryMembership::from_roster(&settings.membership.channels));
    let store = Arc::new(InMemoryMessageStore::new(membership.clone()));
    let server = Arc::new(ChatServer::new(settings.realtime.clone(), membership, store));

    // Start TCP listener
    let listener = TcpListener::bind(settings.server_addr()).await?;
    info!("WebSocket fan-out server listening on {}", settings.server_addr());

    // Connection accept loop
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let server = server.clone();

                    // Spawn handler task for each connection
                    tokio::spawn(async move {
                        match handle_connection(stream, server).await {
                            Ok(()) => {}
                            // Rejected upstream identities and evicted slow
                            // consumers are routine
                            Err(e @ AppError::MissingIdentity)
                            | Err(e @ AppError::SlowConsumerOverflow { .. }) => {
                                warn!(peer = %addr, "Connection ended: {}", e);
                            }
                            Err(e) => error!("Connection handler error: {}", e),
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let remaining = server.shutdown().await;
    info!(remaining, "Server stopped");

    Ok(())
}
