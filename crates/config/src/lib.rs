//! Turnstile configuration structures to map the turnstile.toml configuration.

#![deny(missing_docs)]

mod health;
mod loader;
mod rate_limit;
mod route;
mod server;
mod status;

use std::path::Path;

pub use health::HealthConfig;
pub use rate_limit::*;
pub use route::{RouteRateLimit, RouteRateLimitTable};
use serde::Deserialize;
pub use server::ServerConfig;
pub use status::{InvalidStatusPattern, StatusPattern};

/// Main configuration structure for Turnstile.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Rate limiting configuration settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates bucket definitions and every bucket reference.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate_rate_limits(&self.rate_limit).map(|_| ())
    }
}
