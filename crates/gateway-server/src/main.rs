//! Control plane gateway
//!
//! Serves the gateway WebSocket protocol on `/ws` and a plain health check on
//! `/health`. Process state lives under `CP_STATE_DIR`.

mod config;
mod downstream;
mod error;
mod gateway;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::GatewayConfig;
use crate::downstream::UnavailableDownstream;
use crate::state::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cp_gateway=debug,cp_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env();
    let bind = config.bind;
    tracing::info!("Using state directory: {:?}", config.state_dir);

    let gateway = Gateway::new(config, Arc::new(UnavailableDownstream::default()))
        .await
        .context("failed to initialize gateway state")?;
    gateway.start_background().await;

    let app = Router::new()
        .merge(routes::health::router())
        .merge(routes::gateway::router())
        .with_state(gateway.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    tracing::info!("Gateway listening on {}", bind);

    let shutdown_gateway = gateway.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", err);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
            shutdown_gateway.shutdown("gateway stopping", None).await;
        })
        .await
        .context("server error")?;

    tracing::info!("Gateway stopped");
    Ok(())
}
