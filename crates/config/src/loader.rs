use std::{collections::BTreeSet, path::Path};

use anyhow::bail;
use http::Method;

use crate::{Config, ExcludeConfig, RateLimitConfig, RouteRateLimit};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;

    let warnings = validate_rate_limits(&config.rate_limit)?;

    for warning in warnings {
        log::warn!("{warning}");
    }

    Ok(config)
}

/// Checks every cross reference in the rate limit configuration.
///
/// Hard errors are returned as `Err`, suspicious but valid settings as warnings.
pub(crate) fn validate_rate_limits(config: &RateLimitConfig) -> anyhow::Result<Vec<String>> {
    let mut warnings = Vec::new();
    let mut names = BTreeSet::new();

    for bucket in &config.buckets {
        if bucket.name.trim().is_empty() {
            bail!("Rate limit bucket names must not be empty");
        }

        if bucket.name.contains(':') {
            bail!("Rate limit bucket name '{}' must not contain ':'", bucket.name);
        }

        if !names.insert(bucket.name.as_str()) {
            bail!("Rate limit bucket '{}' is defined more than once", bucket.name);
        }

        if bucket.max == 0 {
            bail!("Rate limit bucket '{}' must allow at least one request (max > 0)", bucket.name);
        }

        if bucket.interval.is_zero() {
            bail!("Rate limit bucket '{}' must have a non-zero interval", bucket.name);
        }

        if bucket.codes.is_empty() {
            bail!(
                "Rate limit bucket '{}' must list at least one status code pattern",
                bucket.name
            );
        }
    }

    for name in &config.default {
        if !names.contains(name.as_str()) {
            bail!("Default rate limit bucket '{name}' is not defined in rate_limit.buckets");
        }
    }

    validate_exclude("rate_limit.exclude", &config.exclude)?;

    let mut referenced: BTreeSet<&str> = config.default.iter().map(String::as_str).collect();

    for (path, route) in &config.routes {
        for name in route.bucket_names() {
            if !names.contains(name.as_str()) {
                bail!("Route '{path}' references undefined rate limit bucket '{name}'");
            }

            referenced.insert(name.as_str());
        }

        if let RouteRateLimit::Full(table) = route {
            validate_exclude(&format!("rate_limit.routes.\"{path}\".exclude"), &table.exclude)?;
        }
    }

    if config.enabled && config.default.is_empty() && config.routes.is_empty() {
        warnings.push("Rate limiting is enabled but neither default buckets nor routes are configured".to_string());
    }

    for name in names.difference(&referenced) {
        warnings.push(format!(
            "Rate limit bucket '{name}' is not used by any route nor by the default bucket list"
        ));
    }

    Ok(warnings)
}

fn validate_exclude(location: &str, exclude: &ExcludeConfig) -> anyhow::Result<()> {
    for method in &exclude.methods {
        if Method::from_bytes(method.as_bytes()).is_err() {
            bail!("Invalid HTTP method '{method}' in {location}");
        }
    }

    Ok(())
}
