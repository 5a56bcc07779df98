//! Line Chat Server - Entry Point
//!
//! Loads settings, starts the chat service and stops it on Ctrl-C.

use std::env;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use linechat::{ChatService, Settings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=linechat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("linechat=info")),
        )
        .init();

    let mut settings = Settings::from_env()?;

    // Bind address from command line overrides CHAT_HOST/CHAT_PORT
    if let Some(addr) = env::args().nth(1) {
        settings.addr = addr;
    }

    let service = ChatService::bind(settings).await?;
    let handle = service.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping");
            if let Err(e) = handle.stop().await {
                error!("Failed to stop server: {}", e);
            }
        }
    });

    let history = service.run().await?;
    info!("Exited with {} messages in history", history.len());

    Ok(())
}
