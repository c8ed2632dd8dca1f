//! Resolves which buckets apply to a request.

use std::collections::BTreeMap;

use config::{ExcludeConfig, RateLimitConfig, RouteRateLimit};
use http::request::Parts;

use crate::hooks::ExcludeHook;

/// Buckets applying to one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Whether the request is subject to limiting at all.
    pub enabled: bool,
    /// Bucket names in priority order: route buckets first, then the global defaults.
    pub buckets: Vec<String>,
}

/// Merges route level and global limiting configuration.
pub struct RouteResolver {
    enabled: bool,
    defaults: Vec<String>,
    exclude: ExcludeConfig,
    exclude_hook: Option<ExcludeHook>,
    routes: BTreeMap<String, RouteRateLimit>,
}

impl RouteResolver {
    /// Creates a resolver over the global configuration.
    pub fn new(config: &RateLimitConfig, exclude_hook: Option<ExcludeHook>) -> Self {
        Self {
            enabled: config.enabled,
            defaults: config.default.clone(),
            exclude: config.exclude.clone(),
            exclude_hook,
            routes: config.routes.clone(),
        }
    }

    /// Route configuration registered under a route path such as `/users/{id}`.
    pub fn route(&self, path: &str) -> Option<&RouteRateLimit> {
        self.routes.get(path)
    }

    /// Computes the buckets for a request.
    ///
    /// A route without configuration only gets the defaults. Duplicate names keep their first
    /// position. Limiting is off when the global switch is off, when the route disables it,
    /// when either exclusion matches, or when no bucket remains.
    pub fn resolve(&self, parts: &Parts, route: Option<&RouteRateLimit>) -> Resolution {
        if !self.enabled {
            return Resolution::default();
        }

        let (enabled, route_buckets, route_exclude) = match route {
            None => (true, &[][..], None),
            Some(RouteRateLimit::Disabled) => (false, &[][..], None),
            Some(RouteRateLimit::Buckets(buckets)) => (true, buckets.as_slice(), None),
            Some(RouteRateLimit::Full(table)) => (table.enabled, table.buckets.as_slice(), Some(&table.exclude)),
        };

        if !enabled {
            return Resolution::default();
        }

        let mut buckets: Vec<String> = Vec::with_capacity(route_buckets.len() + self.defaults.len());

        for name in route_buckets.iter().chain(&self.defaults) {
            if !buckets.contains(name) {
                buckets.push(name.clone());
            }
        }

        let excluded = self.is_excluded(parts) || route_exclude.is_some_and(|exclude| matches_exclude(exclude, parts));

        Resolution {
            enabled: !excluded && !buckets.is_empty(),
            buckets,
        }
    }

    fn is_excluded(&self, parts: &Parts) -> bool {
        matches_exclude(&self.exclude, parts) || self.exclude_hook.as_ref().is_some_and(|hook| hook(parts))
    }
}

fn matches_exclude(exclude: &ExcludeConfig, parts: &Parts) -> bool {
    let method = parts.method.as_str();

    if exclude.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
        return true;
    }

    let path = parts.uri.path();

    exclude
        .paths
        .iter()
        .any(|pattern| fast_glob::glob_match(pattern, path))
}
