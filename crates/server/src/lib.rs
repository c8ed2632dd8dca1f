//! Turnstile server library.
//!
//! Wraps an axum router with the rate limiting middleware and serves it, either for the binary
//! or for the integration tests.

#![deny(missing_docs)]

mod health;
mod rate_limit;
mod status;

use std::{net::SocketAddr, sync::Arc};

use ::rate_limit::RateLimitManager;
use anyhow::anyhow;
use axum::{Router, routing::get};
use config::Config;
use tokio::net::TcpListener;

pub use self::rate_limit::{RateLimitLayer, RateLimitService};
pub use status::status_router;

/// Configuration for serving Turnstile.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized Turnstile TOML configuration.
    pub config: Config,
    /// The routes protected by the rate limiter.
    pub router: Router,
}

/// Builds the application: the given routes behind the rate limiter, plus the health endpoint.
pub async fn app(config: &Config, router: Router) -> anyhow::Result<Router> {
    let mut app = if config.rate_limit.enabled {
        log::debug!("Initializing rate limit manager with {} bucket(s)", config.rate_limit.buckets.len());

        let manager = RateLimitManager::new(config.rate_limit.clone()).await?;

        router.layer(RateLimitLayer::new(Arc::new(manager)))
    } else {
        log::debug!("Rate limiting disabled - no manager created");
        router
    };

    // Added after the rate limit layer so health checks are never limited.
    if config.server.health.enabled {
        app = app.route(&config.server.health.path, get(health::health));
    }

    Ok(app)
}

/// Starts and runs the Turnstile server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        router,
    }: ServeConfig,
) -> anyhow::Result<()> {
    let app = app(&config, router).await?;

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    log::info!("Turnstile listening on http://{listen_address}");

    if config.server.health.enabled {
        log::info!("Health check endpoint exposed at http://{listen_address}{}", config.server.health.path);
    }

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for the shutdown signal: {e}");
        std::future::pending::<()>().await;
    }

    log::info!("Shutting down");
}
