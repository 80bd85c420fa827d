mod client;
mod codec;
mod config;
mod error;
mod routes;
mod staging;
mod vertex;

use anyhow::Context;
use log::{info, warn};
use std::sync::Arc;

use client::ClientSlot;
use config::ServerConfig;

fn init_logging() {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&filters)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = ServerConfig::from_env()?;

    if std::env::var("GOOGLE_CLOUD_PROJECT").is_err() {
        warn!("GOOGLE_CLOUD_PROJECT is not set; /health and /tryon will fail until it is");
    }
    info!("authentication uses application default credentials from the environment");

    let slot = Arc::new(ClientSlot::from_env());
    let routes = routes::routes(slot, config.max_body_bytes);

    let (addr, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(config.addr(), async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .with_context(|| format!("failed to bind {}", config.addr()))?;

    info!("Vertex AI Virtual Try-On server listening on http://{}", addr);
    server.await;

    Ok(())
}
