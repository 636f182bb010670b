mod config;
mod relay;
#[cfg(test)]
mod testing;
mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::relay::RelayCoordinator;
use crate::websocket::{websocket_handler, AppState};

#[derive(Parser, Debug)]
#[command(name = "cove", about = "WebRTC signaling and relay hub")]
struct Cli {
    /// Port to listen on (overrides COVE_PORT)
    #[arg(long)]
    port: Option<u16>,
}

async fn health_check() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    let state = AppState {
        relay: RelayCoordinator::new(),
        config: Arc::new(config.clone()),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("Cove listening on {}", addr);

    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
