//! Rate limit manager implementation.

use std::{collections::HashMap, sync::Arc};

use config::{RateLimitConfig, RouteRateLimit, TimeoutAction};
use http::request::Parts;

use crate::{
    bucket::Bucket,
    clock::{Clock, SystemClock},
    error::{IdentityError, LimiterError, RateLimitError},
    hooks::{Hooks, LimitDecision, LimitEvent, TimeoutDecision},
    identity::{self, Identifier, Identity},
    limiter::{Limiter, Rejection, StoreLimiter},
    route::RouteResolver,
    storage::{self, CacheStore},
    timeout::Deadline,
};

/// Owns the buckets and coordinates both limiting phases of a request.
pub struct RateLimitManager {
    pub(crate) buckets: HashMap<String, Bucket>,
    pub(crate) resolver: RouteResolver,
    pub(crate) limiter: Arc<dyn Limiter>,
    pub(crate) deadline: Deadline,
    pub(crate) timeout_action: TimeoutAction,
    pub(crate) include_headers: bool,
    pub(crate) hooks: Hooks,
}

impl RateLimitManager {
    /// Starts building a manager from configuration.
    pub fn builder(config: RateLimitConfig) -> RateLimitManagerBuilder {
        RateLimitManagerBuilder {
            config,
            storage: None,
            limiter: None,
            clock: None,
            identifiers: HashMap::new(),
            exclude: None,
            hooks: Hooks::default(),
        }
    }

    /// Create a new rate limit manager with the configured storage backend and no hooks.
    pub async fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        Self::builder(config).build().await
    }

    /// Route specific configuration registered under a route path.
    pub fn route(&self, path: &str) -> Option<&RouteRateLimit> {
        self.resolver.route(path)
    }

    /// Looks up a bucket by name.
    pub fn bucket(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    /// The resolver merging route and global configuration.
    pub fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    pub(crate) fn emit(&self, event: LimitEvent) {
        if let Some(on_event) = &self.hooks.on_event {
            on_event(&event);
        }
    }

    pub(crate) fn on_limit(&self, parts: &Parts, rejection: &Rejection) -> LimitDecision {
        match &self.hooks.on_limit {
            Some(on_limit) => on_limit(parts, rejection, &rejection.bucket),
            None => LimitDecision::Reject,
        }
    }

    pub(crate) fn on_pass(&self, parts: &Parts, buckets: Vec<String>) {
        if let Some(on_pass) = &self.hooks.on_pass {
            on_pass(parts);
        }

        self.emit(LimitEvent::Passed { buckets });
    }

    pub(crate) fn on_timeout(&self, parts: &Parts, error: &LimiterError) -> TimeoutDecision {
        if let Some(on_timeout) = &self.hooks.on_timeout {
            return on_timeout(parts, error);
        }

        match self.timeout_action {
            TimeoutAction::Continue => TimeoutDecision::Continue,
            TimeoutAction::Reject => TimeoutDecision::Reject(http::StatusCode::SERVICE_UNAVAILABLE),
        }
    }
}

/// Builder for [`RateLimitManager`].
pub struct RateLimitManagerBuilder {
    config: RateLimitConfig,
    storage: Option<Arc<dyn CacheStore>>,
    limiter: Option<Arc<dyn Limiter>>,
    clock: Option<Arc<dyn Clock>>,
    identifiers: HashMap<String, Arc<dyn Identifier>>,
    exclude: Option<crate::hooks::ExcludeHook>,
    hooks: Hooks,
}

impl RateLimitManagerBuilder {
    /// Uses this store instead of the configured backend.
    pub fn storage(mut self, storage: Arc<dyn CacheStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Uses this limiter instead of a [`StoreLimiter`]. The storage setting is then unused.
    pub fn limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Time source for windows and in-memory expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the configured identity of a bucket.
    pub fn identifier(mut self, bucket: impl Into<String>, identifier: impl Identifier + 'static) -> Self {
        self.identifiers.insert(bucket.into(), Arc::new(identifier));
        self
    }

    /// Extra global exclusion predicate.
    pub fn exclude<F>(mut self, exclude: F) -> Self
    where
        F: Fn(&Parts) -> bool + Send + Sync + 'static,
    {
        self.exclude = Some(Arc::new(exclude));
        self
    }

    /// Called before a rejection is sent. [`LimitDecision::Cancel`] admits the request.
    pub fn on_limit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Parts, &Rejection, &str) -> LimitDecision + Send + Sync + 'static,
    {
        self.hooks.on_limit = Some(Arc::new(hook));
        self
    }

    /// Called when every check passed.
    pub fn on_pass<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Parts) + Send + Sync + 'static,
    {
        self.hooks.on_pass = Some(Arc::new(hook));
        self
    }

    /// Decides what happens to a request whose check timed out.
    pub fn on_timeout<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Parts, &LimiterError) -> TimeoutDecision + Send + Sync + 'static,
    {
        self.hooks.on_timeout = Some(Arc::new(hook));
        self
    }

    /// Receives every decision the manager takes.
    pub fn on_event<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LimitEvent) + Send + Sync + 'static,
    {
        self.hooks.on_event = Some(Arc::new(hook));
        self
    }

    /// Creates the storage and limiter and registers every bucket.
    pub async fn build(mut self) -> Result<RateLimitManager, RateLimitError> {
        let clock = self.clock.take().unwrap_or_else(|| Arc::new(SystemClock));

        let limiter = match self.limiter.take() {
            Some(limiter) => limiter,
            None => {
                let store = match self.storage.take() {
                    Some(store) => store,
                    None => storage::from_config(&self.config.storage, clock.clone()).await?,
                };

                Arc::new(StoreLimiter::new(store, clock)) as Arc<dyn Limiter>
            }
        };

        if let Some(name) = self
            .identifiers
            .keys()
            .find(|name| self.config.bucket(name).is_none())
        {
            return Err(RateLimitError::UnknownBucket(name.clone()));
        }

        let mut buckets = HashMap::with_capacity(self.config.buckets.len());

        for config in &self.config.buckets {
            if buckets.contains_key(&config.name) {
                return Err(RateLimitError::DuplicateBucket(config.name.clone()));
            }

            let identifier = match self.identifiers.remove(&config.name) {
                Some(identifier) => identifier,
                None => identity::from_config(config)?,
            };

            let bucket = Bucket::new(config, identifier, limiter.as_ref())?;
            buckets.insert(config.name.clone(), bucket);
        }

        log::debug!(
            "Rate limiting {} with {} bucket(s)",
            if self.config.enabled { "enabled" } else { "disabled" },
            buckets.len()
        );

        Ok(RateLimitManager {
            buckets,
            resolver: RouteResolver::new(&self.config, self.exclude),
            limiter,
            deadline: Deadline::from_config(&self.config.timeout),
            timeout_action: self.config.timeout.on_timeout,
            include_headers: self.config.include_headers,
            hooks: self.hooks,
        })
    }
}

/// Computes the identity of every bucket, in order.
pub(crate) fn identify_all(
    manager: &RateLimitManager,
    parts: &Parts,
    names: &[String],
) -> Result<Vec<(String, Identity)>, IdentityError> {
    let mut entries = Vec::with_capacity(names.len());

    for name in names {
        let Some(bucket) = manager.buckets.get(name) else {
            log::warn!("Skipping unknown rate limit bucket '{name}'");
            continue;
        };

        entries.push((name.clone(), bucket.identify(parts)?));
    }

    Ok(entries)
}
