//! Rate limiting configuration structures.

use std::{collections::BTreeMap, time::Duration};

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;

use crate::{RouteRateLimit, StatusPattern, status::default_codes};

/// Global rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled at all.
    pub enabled: bool,
    /// Whether settled responses carry the `X-Rate-Limit*` headers.
    pub include_headers: bool,
    /// Storage backend configuration.
    pub storage: StorageConfig,
    /// Deadline applied to every limiter call.
    pub timeout: TimeoutConfig,
    /// Requests matching these rules are never limited.
    pub exclude: ExcludeConfig,
    /// Every bucket the server knows about.
    pub buckets: Vec<BucketConfig>,
    /// Buckets applied to every request, after the route specific ones.
    pub default: Vec<String>,
    /// Route specific configuration, keyed by the route path as registered in the router.
    pub routes: BTreeMap<String, RouteRateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            include_headers: true,
            storage: StorageConfig::default(),
            timeout: TimeoutConfig::default(),
            exclude: ExcludeConfig::default(),
            buckets: Vec::new(),
            default: Vec::new(),
            routes: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Looks up a bucket definition by name.
    pub fn bucket(&self, name: &str) -> Option<&BucketConfig> {
        self.buckets.iter().find(|bucket| bucket.name == name)
    }
}

/// A named limiting rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketConfig {
    /// Unique name of the bucket.
    pub name: String,
    /// Length of the window.
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    /// Requests permitted per window.
    pub max: u32,
    /// Windowing semantics.
    #[serde(default)]
    pub mode: WindowMode,
    /// Response statuses that are counted against this bucket.
    #[serde(default = "default_codes")]
    pub codes: Vec<StatusPattern>,
    /// How the limited subject is identified.
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// How a bucket's window advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Fixed windows that reset every interval.
    #[default]
    Interval,
    /// A window sliding continuously over the last interval.
    Continuous,
}

/// Source of the identity a bucket limits on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum IdentityConfig {
    /// One shared identity for every request.
    Global,
    /// The client IP address.
    #[default]
    ClientIp,
    /// The value of a request header.
    Header {
        /// Header name, e.g. `x-api-key`.
        name: String,
    },
}

/// Declarative exclusion rules. A request is excluded if any rule matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExcludeConfig {
    /// Glob patterns matched against the request path.
    pub paths: Vec<String>,
    /// HTTP methods that are never limited.
    pub methods: Vec<String>,
}

impl ExcludeConfig {
    /// True if no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.methods.is_empty()
    }
}

/// Deadline for limiter calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Whether limiter calls are bounded at all.
    pub enabled: bool,
    /// How long a single limiter call may take.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// What happens to a request whose admission check timed out.
    pub on_timeout: TimeoutAction,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_millis(500),
            on_timeout: TimeoutAction::default(),
        }
    }
}

/// Configured reaction to an admission check timing out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
    /// Admit the request.
    #[default]
    Continue,
    /// Respond with 503 Service Unavailable.
    Reject,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (default).
    #[default]
    Memory,
    /// Redis storage with configuration.
    Redis(Box<RedisConfig>),
}

/// Redis storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Redis connection URL (redis:// or rediss:// for TLS).
    pub url: String,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: RedisPoolConfig,
    /// Prefix for every key written by the limiter.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "turnstile:".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            pool: RedisPoolConfig::default(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of connections.
    pub max_size: Option<usize>,
    /// Timeout for creating connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_create: Option<Duration>,
    /// Timeout for waiting for a connection.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Timeout before recycling idle connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(16),
            timeout_create: Some(Duration::from_secs(5)),
            timeout_wait: Some(Duration::from_secs(5)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}
