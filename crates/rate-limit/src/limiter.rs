//! The limiter contract and its storage backed implementation.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use config::WindowMode;
use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue, header::RETRY_AFTER};
use tokio::sync::Mutex;

use crate::{
    clock::Clock,
    error::{LimiterError, StorageError},
    identity::Identity,
    storage::CacheStore,
};

pub(crate) const X_RATE_LIMIT: HeaderName = HeaderName::from_static("x-rate-limit");
pub(crate) const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub(crate) const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Every key the limiter writes starts with this tag.
const NAMESPACE: &str = "limiter";

/// Window parameters registered for a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    /// Requests permitted per window.
    pub max: u32,
    /// Window length.
    pub interval: Duration,
    /// Windowing semantics.
    pub mode: WindowMode,
}

/// Result of a successful consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    /// Requests counted in the current window, including this one.
    pub count: u32,
    /// Requests permitted per window.
    pub max: u32,
    /// End of the current window in seconds since the epoch. Only known for fixed windows.
    pub reset: Option<u64>,
}

impl Consumed {
    /// Requests still permitted in the current window.
    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.count)
    }
}

/// The identity has no remaining quota in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Name of the exhausted bucket.
    pub bucket: String,
    /// End of the current window in seconds since the epoch, for fixed windows.
    pub reset: Option<u64>,
    /// How long until a slot frees up.
    pub retry_after: Duration,
}

impl Rejection {
    /// Headers attached to a rejected response.
    ///
    /// `X-RateLimit-Reset` carries the window end when known and the bucket name otherwise.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));

        let reset = match self.reset {
            Some(reset) => HeaderValue::from(reset),
            None => HeaderValue::from_str(&self.bucket).unwrap_or(HeaderValue::from_static("0")),
        };

        headers.insert(X_RATELIMIT_RESET, reset);

        let retry_after = self.retry_after.as_millis().div_ceil(1000);
        headers.insert(RETRY_AFTER, HeaderValue::from(u64::try_from(retry_after).unwrap_or(u64::MAX)));

        headers
    }
}

/// A counting service tracking requests per bucket and identity.
///
/// `check_limited` and `consume` are independent calls. Callers must not assume they are atomic
/// with each other.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Registers the window parameters of a bucket. Called once per bucket at startup.
    fn register_rule(&self, name: &str, rule: Rule);

    /// Non-consuming check whether the identity has room left in the bucket.
    async fn check_limited(&self, name: &str, identity: &Identity) -> Result<(), LimiterError>;

    /// Counts one request against the bucket.
    async fn consume(&self, name: &str, identity: &Identity) -> Result<Consumed, LimiterError>;
}

/// A [`Limiter`] keeping its counters in a [`CacheStore`].
///
/// Fixed windows are aligned to the epoch and stored as a plain counter under
/// `limiter:{bucket}:{identity}:{window}`. Continuous windows keep the timestamps of the hits
/// inside the last interval under `limiter:{bucket}:{identity}`.
///
/// Consumes of the same key are serialized, so concurrent requests of one process never lose
/// an increment or overshoot `max`.
pub struct StoreLimiter {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    rules: DashMap<String, Rule>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

struct FixedWindow {
    key: String,
    now: u64,
    end: u64,
}

impl FixedWindow {
    fn reset(&self) -> u64 {
        self.end.div_ceil(1000)
    }

    fn remaining(&self) -> Duration {
        Duration::from_millis(self.end.saturating_sub(self.now))
    }
}

impl StoreLimiter {
    /// Creates a limiter over the given store.
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            rules: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Runs the read-modify-write `update` while holding the lock of `key`.
    async fn exclusive<T, F>(&self, key: &str, update: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self.locks.entry(key.to_string()).or_default().clone();

        let result = {
            let _guard = lock.lock().await;
            update.await
        };

        drop(lock);

        // Only the map holds the lock now, nobody is waiting on it.
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    fn rule(&self, name: &str) -> Result<Rule, LimiterError> {
        self.rules
            .get(name)
            .map(|rule| *rule)
            .ok_or_else(|| LimiterError::UnknownBucket(name.to_string()))
    }

    fn fixed_window(&self, name: &str, identity: &Identity, rule: &Rule) -> FixedWindow {
        let now = self.clock.now_millis();
        let interval = interval_millis(rule);
        let window = now / interval;

        FixedWindow {
            key: format!("{NAMESPACE}:{name}:{}:{window}", identity.storage_key()),
            now,
            end: (window + 1) * interval,
        }
    }

    async fn read_count(&self, key: &str) -> Result<u32, LimiterError> {
        let Some(value) = self.store.get(key).await? else {
            return Ok(0);
        };

        let count = value
            .parse()
            .map_err(|_| StorageError::Codec(format!("invalid counter value '{value}' at '{key}'")))?;

        Ok(count)
    }

    /// Hits newer than `since`, oldest first.
    async fn read_hits(&self, key: &str, since: u64) -> Result<Vec<u64>, LimiterError> {
        let Some(value) = self.store.get(key).await? else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<u64> = serde_json::from_str(&value)
            .map_err(|e| StorageError::Codec(format!("invalid hit log at '{key}': {e}")))?;

        hits.retain(|hit| *hit > since);

        Ok(hits)
    }

    async fn sliding_hits(&self, name: &str, identity: &Identity, rule: &Rule) -> Result<(String, u64, Vec<u64>), LimiterError> {
        let key = sliding_key(name, identity);
        let now = self.clock.now_millis();
        let hits = self.read_hits(&key, now.saturating_sub(interval_millis(rule))).await?;

        Ok((key, now, hits))
    }

    fn sliding_rejection(name: &str, rule: &Rule, now: u64, hits: &[u64]) -> LimiterError {
        let oldest = hits.first().copied().unwrap_or(now);
        let frees_at = oldest + interval_millis(rule);

        LimiterError::Exceeded(Rejection {
            bucket: name.to_string(),
            reset: None,
            retry_after: Duration::from_millis(frees_at.saturating_sub(now)),
        })
    }
}

#[async_trait]
impl Limiter for StoreLimiter {
    fn register_rule(&self, name: &str, rule: Rule) {
        log::debug!("Registering rate limit rule '{name}': {} per {:?} ({:?})", rule.max, rule.interval, rule.mode);

        if self.rules.insert(name.to_string(), rule).is_some() {
            log::warn!("Rate limit rule '{name}' was registered twice, the last registration wins");
        }
    }

    async fn check_limited(&self, name: &str, identity: &Identity) -> Result<(), LimiterError> {
        let rule = self.rule(name)?;

        match rule.mode {
            WindowMode::Interval => {
                let window = self.fixed_window(name, identity, &rule);
                let count = self.read_count(&window.key).await?;

                if count >= rule.max {
                    return Err(LimiterError::Exceeded(Rejection {
                        bucket: name.to_string(),
                        reset: Some(window.reset()),
                        retry_after: window.remaining(),
                    }));
                }
            }
            WindowMode::Continuous => {
                let (_, now, hits) = self.sliding_hits(name, identity, &rule).await?;

                if hits.len() >= rule.max as usize {
                    return Err(Self::sliding_rejection(name, &rule, now, &hits));
                }
            }
        }

        Ok(())
    }

    async fn consume(&self, name: &str, identity: &Identity) -> Result<Consumed, LimiterError> {
        let rule = self.rule(name)?;

        match rule.mode {
            WindowMode::Interval => {
                let window = self.fixed_window(name, identity, &rule);

                self.exclusive(&window.key, async {
                    let count = self.read_count(&window.key).await?.saturating_add(1);

                    if count > rule.max {
                        return Err(LimiterError::Exceeded(Rejection {
                            bucket: name.to_string(),
                            reset: Some(window.reset()),
                            retry_after: window.remaining(),
                        }));
                    }

                    self.store
                        .set(&window.key, count.to_string(), window.remaining())
                        .await?;

                    Ok(Consumed {
                        count,
                        max: rule.max,
                        reset: Some(window.reset()),
                    })
                })
                .await
            }
            WindowMode::Continuous => {
                self.exclusive(&sliding_key(name, identity), async {
                    let (key, now, mut hits) = self.sliding_hits(name, identity, &rule).await?;

                    if hits.len() >= rule.max as usize {
                        return Err(Self::sliding_rejection(name, &rule, now, &hits));
                    }

                    hits.push(now);

                    let value = serde_json::to_string(&hits).map_err(|e| StorageError::Codec(e.to_string()))?;
                    self.store.set(&key, value, rule.interval).await?;

                    Ok(Consumed {
                        count: u32::try_from(hits.len()).unwrap_or(u32::MAX),
                        max: rule.max,
                        reset: None,
                    })
                })
                .await
            }
        }
    }
}

fn sliding_key(name: &str, identity: &Identity) -> String {
    format!("{NAMESPACE}:{name}:{}", identity.storage_key())
}

fn interval_millis(rule: &Rule) -> u64 {
    u64::try_from(rule.interval.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, storage::InMemoryStore};

    fn limiter(clock: &ManualClock) -> StoreLimiter {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        StoreLimiter::new(Arc::new(InMemoryStore::new(clock.clone())), clock)
    }

    fn rule(max: u32, millis: u64, mode: WindowMode) -> Rule {
        Rule {
            max,
            interval: Duration::from_millis(millis),
            mode,
        }
    }

    #[tokio::test]
    async fn fixed_window_counts_and_resets() {
        let clock = ManualClock::new(1_000_000);
        let limiter = limiter(&clock);
        let user = Identity::from("user");

        limiter.register_rule("api", rule(2, 1_000, WindowMode::Interval));

        limiter.check_limited("api", &user).await.unwrap();
        let first = limiter.consume("api", &user).await.unwrap();
        assert_eq!((first.count, first.remaining(), first.reset), (1, 1, Some(1_001)));

        let second = limiter.consume("api", &user).await.unwrap();
        assert_eq!(second.remaining(), 0);

        let Err(LimiterError::Exceeded(rejection)) = limiter.check_limited("api", &user).await else {
            unreachable!("third request must be limited");
        };

        assert_eq!(rejection.bucket, "api");
        assert_eq!(rejection.reset, Some(1_001));
        assert_eq!(rejection.retry_after, Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));

        limiter.check_limited("api", &user).await.unwrap();
        assert_eq!(limiter.consume("api", &user).await.unwrap().remaining(), 1);
    }

    #[tokio::test]
    async fn identities_are_counted_separately() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);

        limiter.register_rule("api", rule(1, 60_000, WindowMode::Interval));

        limiter.consume("api", &Identity::from("a")).await.unwrap();

        assert!(limiter.check_limited("api", &Identity::from("a")).await.is_err());
        assert!(limiter.check_limited("api", &Identity::from("b")).await.is_ok());
    }

    #[tokio::test]
    async fn sliding_window_frees_the_oldest_hit() {
        let clock = ManualClock::new(50_000);
        let limiter = limiter(&clock);
        let user = Identity::from("user");

        limiter.register_rule("login", rule(2, 10_000, WindowMode::Continuous));

        limiter.consume("login", &user).await.unwrap();
        clock.advance(Duration::from_secs(4));

        let consumed = limiter.consume("login", &user).await.unwrap();
        assert_eq!(consumed, Consumed { count: 2, max: 2, reset: None });

        let Err(LimiterError::Exceeded(rejection)) = limiter.check_limited("login", &user).await else {
            unreachable!("window is full");
        };

        assert_eq!(rejection.reset, None);
        assert_eq!(rejection.retry_after, Duration::from_secs(6));

        clock.advance(Duration::from_secs(6));

        limiter.check_limited("login", &user).await.unwrap();
        assert_eq!(limiter.consume("login", &user).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn consume_refuses_past_max() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        let user = Identity::from("user");

        limiter.register_rule("api", rule(1, 1_000, WindowMode::Interval));
        limiter.consume("api", &user).await.unwrap();

        let result = limiter.consume("api", &user).await;
        assert!(matches!(result, Err(LimiterError::Exceeded(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_consumes_never_exceed_max() {
        for mode in [WindowMode::Interval, WindowMode::Continuous] {
            let limiter = Arc::new(limiter(&ManualClock::new(0)));
            limiter.register_rule("api", rule(5, 60_000, mode));

            let tasks: Vec<_> = (0..500)
                .map(|_| {
                    let limiter = limiter.clone();
                    tokio::spawn(async move { limiter.consume("api", &Identity::from("u")).await.is_ok() })
                })
                .collect();

            let mut admitted = 0;

            for task in tasks {
                if task.await.unwrap() {
                    admitted += 1;
                }
            }

            assert_eq!(admitted, 5, "{mode:?}");
            assert!(limiter.locks.is_empty());
        }
    }

    #[tokio::test]
    async fn colons_in_identities_do_not_share_counters() {
        let limiter = limiter(&ManualClock::new(0));
        limiter.register_rule("api", rule(1, 60_000, WindowMode::Interval));

        let composite = Identity::Composite(vec![Identity::from("a"), Identity::from("b")]);
        limiter.consume("api", &composite).await.unwrap();

        assert!(limiter.check_limited("api", &composite).await.is_err());
        assert!(limiter.check_limited("api", &Identity::from("a:b")).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_bucket() {
        let limiter = limiter(&ManualClock::new(0));
        let error = limiter.check_limited("nope", &Identity::from("a")).await.unwrap_err();

        insta::assert_snapshot!(error.to_string(), @"No rate limit rule registered for bucket 'nope'");
    }

    #[test]
    fn rejection_headers() {
        let rejection = Rejection {
            bucket: "api".to_string(),
            reset: Some(1_700_000_060),
            retry_after: Duration::from_millis(1_500),
        };

        let headers = rejection.headers();
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[X_RATELIMIT_RESET], "1700000060");
        assert_eq!(headers[RETRY_AFTER], "2");

        let sliding = Rejection { reset: None, ..rejection };
        assert_eq!(sliding.headers()[X_RATELIMIT_RESET], "api");
    }
}
