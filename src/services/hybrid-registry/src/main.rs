//! Hybrid Registry Server
//!
//! Runs the hybrid connection registry with its admin HTTP API: tiered service
//! lookups, health monitoring of every registered instance and connection
//! method changes without restarts.

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use hybrid_registry::{
    config::{Args, HybridRegistryConfig},
    handlers::{create_router, AppState},
    registry::RegistryComponents,
    transport::InProcessRouter,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Telemetry and observability setup
mod telemetry {
    use anyhow::Result;
    use hybrid_registry::config::HybridRegistryConfig;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    /// Initialize tracing and logging
    pub fn init_tracing(config: &HybridRegistryConfig) -> Result<()> {
        let log_level = &config.logging.level;
        let log_format = &config.logging.format;

        let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = match log_format.as_str() {
            "json" => fmt::layer().json().boxed(),
            _ => fmt::layer().pretty().boxed(),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;

        Ok(())
    }
}

/// Middleware setup
mod middleware {
    use axum::Router;
    use tower::ServiceBuilder;
    use tower_http::trace::TraceLayer;

    pub fn apply(router: Router) -> Router {
        router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }
}

/// Graceful shutdown handling
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let config = Arc::new(HybridRegistryConfig::load(&args)?);

    // Initialize telemetry
    telemetry::init_tracing(&config)?;

    info!("Starting Hybrid Registry Server v{}", hybrid_registry::VERSION);
    info!("Configuration loaded from: {:?}", args.config);

    // Services mounted in this process register their handlers here
    let router = Arc::new(InProcessRouter::new());

    info!("Connecting registry backends...");
    let components = RegistryComponents::connect(Arc::clone(&config), router)
        .await
        .context("Failed to connect registry backends")?;

    components
        .registry
        .initialize()
        .await
        .context("Failed to initialize service registry")?;
    components.start_background_tasks();

    let app = middleware::apply(create_router(AppState::from_components(&components)));

    // Start the HTTP server
    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to server address")?;

    info!("Hybrid Registry Server listening on {}", addr);
    info!("Health endpoint: http://{}/health", addr);

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server failed")?;

    info!("Shutting down Hybrid Registry Server...");

    if tokio::time::timeout(config.server.shutdown_timeout(), components.shutdown())
        .await
        .is_err()
    {
        warn!("Health monitor did not stop within the shutdown timeout");
    }

    info!("Hybrid Registry Server shutdown complete");
    Ok(())
}
