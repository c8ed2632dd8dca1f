//! A named limiting rule.

use std::{fmt, sync::Arc};

use config::{BucketConfig, StatusPattern, WindowMode};
use http::{HeaderMap, HeaderValue, StatusCode, request::Parts};

use crate::{
    error::{IdentityError, RateLimitError},
    identity::{Identifier, Identity},
    limiter::{Consumed, Limiter, Rule, X_RATE_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET},
};

/// A named limiting rule, shared read-only by every request.
pub struct Bucket {
    name: String,
    rule: Rule,
    codes: Vec<StatusPattern>,
    identifier: Arc<dyn Identifier>,
}

impl Bucket {
    /// Validates the definition and registers its rule with the limiter.
    pub fn new(config: &BucketConfig, identifier: Arc<dyn Identifier>, limiter: &dyn Limiter) -> Result<Self, RateLimitError> {
        let invalid = |reason: &str| RateLimitError::InvalidBucket {
            name: config.name.clone(),
            reason: reason.to_string(),
        };

        if config.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }

        // Storage keys use ':' as separator.
        if config.name.contains(':') {
            return Err(invalid("name must not contain ':'"));
        }

        if config.max == 0 {
            return Err(invalid("max must be greater than zero"));
        }

        if config.interval.is_zero() {
            return Err(invalid("interval must be greater than zero"));
        }

        if config.codes.is_empty() {
            return Err(invalid("at least one status code pattern is required"));
        }

        let rule = Rule {
            max: config.max,
            interval: config.interval,
            mode: config.mode,
        };

        limiter.register_rule(&config.name, rule);

        Ok(Self {
            name: config.name.clone(),
            rule,
            codes: config.codes.clone(),
            identifier,
        })
    }

    /// The unique bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The window parameters registered with the limiter.
    pub fn rule(&self) -> Rule {
        self.rule
    }

    /// True if any of the bucket's status patterns matches.
    pub fn matches(&self, status: StatusCode) -> bool {
        self.codes.iter().any(|pattern| pattern.matches(status))
    }

    /// The identity of the request within this bucket.
    pub fn identify(&self, parts: &Parts) -> Result<Identity, IdentityError> {
        self.identifier.identify(parts)
    }

    /// Headers describing the bucket after a consume.
    ///
    /// `X-Rate-Limit` is always present. Remaining and reset are only meaningful for fixed
    /// windows and are left out in continuous mode.
    pub fn headers(&self, consumed: &Consumed) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert(X_RATE_LIMIT, HeaderValue::from(self.rule.max));

        if self.rule.mode == WindowMode::Interval {
            headers.insert(
                X_RATELIMIT_REMAINING,
                HeaderValue::from(self.rule.max.saturating_sub(consumed.count)),
            );

            if let Some(reset) = consumed.reset {
                headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset));
            }
        }

        headers
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("rule", &self.rule)
            .field("codes", &self.codes)
            .finish_non_exhaustive()
    }
}
