//! Per-route rate limiting configuration.

use serde::Deserialize;

use crate::ExcludeConfig;

/// Rate limiting settings for a single route.
///
/// Accepts every shorthand a route may be configured with:
///
/// ```toml
/// "/metrics" = false                      # Disabled
/// "/search" = "search"                    # Buckets(["search"])
/// "/export" = ["export", "per-ip"]        # Buckets(["export", "per-ip"])
/// "/login" = { buckets = ["login"], enabled = true, exclude = { methods = ["GET"] } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawRouteRateLimit")]
pub enum RouteRateLimit {
    /// Limiting is switched off for the route.
    Disabled,
    /// Route specific buckets, checked before the global defaults.
    Buckets(Vec<String>),
    /// The complete form.
    Full(RouteRateLimitTable),
}

impl RouteRateLimit {
    /// Bucket names listed by the route itself, without the global defaults.
    pub fn bucket_names(&self) -> &[String] {
        match self {
            RouteRateLimit::Disabled => &[],
            RouteRateLimit::Buckets(buckets) => buckets,
            RouteRateLimit::Full(table) => &table.buckets,
        }
    }
}

/// The table form of a route configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteRateLimitTable {
    /// Route specific buckets.
    pub buckets: Vec<String>,
    /// Whether limiting applies to the route.
    pub enabled: bool,
    /// Route level exclusion rules.
    pub exclude: ExcludeConfig,
}

impl Default for RouteRateLimitTable {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            enabled: true,
            exclude: ExcludeConfig::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRouteRateLimit {
    Toggle(bool),
    Bucket(String),
    Buckets(Vec<String>),
    Table(RouteRateLimitTable),
}

impl From<RawRouteRateLimit> for RouteRateLimit {
    fn from(raw: RawRouteRateLimit) -> Self {
        match raw {
            RawRouteRateLimit::Toggle(false) => RouteRateLimit::Disabled,
            RawRouteRateLimit::Toggle(true) => RouteRateLimit::Buckets(Vec::new()),
            RawRouteRateLimit::Bucket(name) => RouteRateLimit::Buckets(vec![name]),
            RawRouteRateLimit::Buckets(names) => RouteRateLimit::Buckets(names),
            RawRouteRateLimit::Table(table) => RouteRateLimit::Full(table),
        }
    }
}
