//! Admission: the phase running before the handler.

use futures::{StreamExt, future::BoxFuture, stream::FuturesUnordered};
use http::{StatusCode, request::Parts};

use config::RouteRateLimit;

use crate::{
    error::LimiterError,
    hooks::{LimitDecision, LimitEvent, TimeoutDecision},
    identity::Identity,
    limiter::Rejection,
    manager::{RateLimitManager, identify_all},
    state::LimitingState,
};

/// Outcome of [`RateLimitManager::admit`].
#[derive(Debug)]
pub enum Admission {
    /// Limiting does not apply to the request.
    Skipped,
    /// Every check passed, or the `on_limit` hook vetoed the rejection.
    Passed,
    /// A bucket is exhausted. Respond with 429 and [`Rejection::headers`].
    Limited(Rejection),
    /// A check failed or timed out. The request is admitted.
    FailedOpen(LimiterError),
    /// A check timed out and the timeout policy rejects the request.
    Refused {
        /// Status to respond with.
        status: StatusCode,
        /// The timeout.
        error: LimiterError,
    },
}

impl Admission {
    /// True if the request may reach the handler.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Skipped | Self::Passed | Self::FailedOpen(_))
    }
}

impl RateLimitManager {
    /// Decides whether a request may reach its handler.
    ///
    /// On every path that runs checks a [`LimitingState`] is inserted into the request
    /// extensions first. Limiter failures admit the request.
    pub async fn admit(&self, parts: &mut Parts, route: Option<&RouteRateLimit>) -> Admission {
        let resolution = self.resolver.resolve(parts, route);

        if !resolution.enabled {
            self.emit(LimitEvent::Skipped);
            return Admission::Skipped;
        }

        let entries = match identify_all(self, parts, &resolution.buckets) {
            Ok(entries) => entries,
            Err(error) => {
                log::error!("Failed to identify request for rate limiting, admitting it: {error}");

                let error = LimiterError::Identity(error);
                self.emit(LimitEvent::CheckFailed { error: error.clone() });

                return Admission::FailedOpen(error);
            }
        };

        if entries.is_empty() {
            self.emit(LimitEvent::Skipped);
            return Admission::Skipped;
        }

        parts.extensions.insert(LimitingState::new(entries.clone()));

        match self.check_all(&entries).await {
            Ok(()) => {
                self.on_pass(parts, bucket_names(&entries));
                Admission::Passed
            }
            Err(LimiterError::Exceeded(rejection)) => {
                if self.on_limit(parts, &rejection) == LimitDecision::Cancel {
                    log::debug!("Rejection by bucket '{}' cancelled by the limit hook", rejection.bucket);

                    self.emit(LimitEvent::LimitCancelled { rejection });
                    self.on_pass(parts, bucket_names(&entries));

                    return Admission::Passed;
                }

                log::debug!("Request limited by bucket '{}'", rejection.bucket);

                mark_limited(parts);
                self.emit(LimitEvent::Limited {
                    rejection: rejection.clone(),
                });

                Admission::Limited(rejection)
            }
            Err(error) if error.is_timeout() => {
                log::warn!("Rate limit check timed out: {error}");

                self.emit(LimitEvent::CheckTimedOut { error: error.clone() });

                match self.on_timeout(parts, &error) {
                    TimeoutDecision::Continue => Admission::FailedOpen(error),
                    TimeoutDecision::Reject(status) => {
                        mark_limited(parts);
                        Admission::Refused { status, error }
                    }
                }
            }
            Err(error) => {
                log::error!("Rate limit check failed, admitting request: {error}");

                self.emit(LimitEvent::CheckFailed { error: error.clone() });

                Admission::FailedOpen(error)
            }
        }
    }

    /// Checks every bucket concurrently.
    ///
    /// Succeeds only when all checks succeed. The first failure to complete is returned right
    /// away; the remaining checks run to completion in the background and their results are
    /// dropped.
    async fn check_all(&self, entries: &[(String, Identity)]) -> Result<(), LimiterError> {
        let mut pending: FuturesUnordered<BoxFuture<'static, Result<(), LimiterError>>> = entries
            .iter()
            .map(|(name, identity)| {
                let limiter = self.limiter.clone();
                let deadline = self.deadline;
                let name = name.clone();
                let identity = identity.clone();

                Box::pin(async move { deadline.run(async move { limiter.check_limited(&name, &identity).await }).await })
                    as BoxFuture<'static, _>
            })
            .collect();

        let mut passed = 0;

        while let Some(result) = pending.next().await {
            match result {
                Ok(()) => passed += 1,
                Err(error) => {
                    if !pending.is_empty() {
                        tokio::spawn(async move { while pending.next().await.is_some() {} });
                    }

                    return Err(error);
                }
            }
        }

        log::debug!("All {passed} rate limit check(s) passed");

        Ok(())
    }
}

fn bucket_names(entries: &[(String, Identity)]) -> Vec<String> {
    entries.iter().map(|(name, _)| name.clone()).collect()
}

fn mark_limited(parts: &mut Parts) {
    if let Some(state) = parts.extensions.get_mut::<LimitingState>() {
        state.mark_limited();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use http::Request;
    use indoc::indoc;

    use super::*;
    use crate::{
        error::StorageError,
        identity::ClientIp,
        manager::RateLimitManagerBuilder,
        testing::{Behavior, RecordingLimiter},
    };

    const CONFIG: &str = indoc! {r#"
        [rate_limit]
        enabled = true
        default = ["per-ip"]

        [rate_limit.exclude]
        paths = ["/health"]

        [[rate_limit.buckets]]
        name = "per-ip"
        interval = "1m"
        max = 60

        [[rate_limit.buckets]]
        name = "login"
        interval = "15m"
        max = 5
        codes = ["4xx"]

        [rate_limit.routes]
        "/login" = "login"
    "#};

    fn builder(toml: &str, limiter: &RecordingLimiter) -> RateLimitManagerBuilder {
        let config = toml::from_str::<config::Config>(toml).unwrap().rate_limit;
        RateLimitManager::builder(config).limiter(Arc::new(limiter.clone()))
    }

    fn request(path: &str) -> Parts {
        Request::builder()
            .uri(path)
            .extension(ClientIp(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    async fn admit(manager: &RateLimitManager, parts: &mut Parts) -> Admission {
        let route = manager.route(parts.uri.path()).cloned();
        manager.admit(parts, route.as_ref()).await
    }

    fn exceeded(bucket: &str) -> Behavior {
        Behavior::Fail(LimiterError::Exceeded(Rejection {
            bucket: bucket.to_string(),
            reset: Some(1_700_000_000),
            retry_after: Duration::from_secs(30),
        }))
    }

    #[tokio::test]
    async fn passes_and_attaches_state() {
        let limiter = RecordingLimiter::default();
        let passes = Arc::new(AtomicUsize::new(0));

        let manager = builder(CONFIG, &limiter)
            .on_pass({
                let passes = passes.clone();
                move |_| {
                    passes.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .await
            .unwrap();

        let mut parts = request("/login");
        let admission = admit(&manager, &mut parts).await;

        assert!(matches!(admission, Admission::Passed));
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        let state = parts.extensions.get::<LimitingState>().unwrap();
        assert!(!state.is_limited());
        assert_eq!(state.bucket_names().collect::<Vec<_>>(), ["login", "per-ip"]);
        assert_eq!(state.identities().count(), state.bucket_names().count());

        let mut checked: Vec<_> = limiter.checks().into_iter().map(|(name, _)| name).collect();
        checked.sort();
        assert_eq!(checked, ["login", "per-ip"]);
    }

    #[tokio::test]
    async fn excluded_requests_are_not_checked() {
        let limiter = RecordingLimiter::default();
        let manager = builder(CONFIG, &limiter).build().await.unwrap();

        let mut parts = request("/health");
        let admission = admit(&manager, &mut parts).await;

        assert!(matches!(admission, Admission::Skipped));
        assert!(parts.extensions.get::<LimitingState>().is_none());
        assert!(limiter.checks().is_empty());
    }

    #[tokio::test]
    async fn exhausted_bucket_limits() {
        let limiter = RecordingLimiter::default().on_check("login", exceeded("login"));
        let limited = Arc::new(Mutex::new(Vec::new()));

        let manager = builder(CONFIG, &limiter)
            .on_event({
                let limited = limited.clone();
                move |event| {
                    if let LimitEvent::Limited { rejection } = event {
                        limited.lock().unwrap().push(rejection.bucket.clone());
                    }
                }
            })
            .build()
            .await
            .unwrap();

        let mut parts = request("/login");
        let admission = admit(&manager, &mut parts).await;

        let Admission::Limited(rejection) = admission else {
            unreachable!("request must be limited");
        };

        assert_eq!(rejection.bucket, "login");
        assert!(parts.extensions.get::<LimitingState>().unwrap().is_limited());
        assert_eq!(*limited.lock().unwrap(), ["login"]);
    }

    #[tokio::test]
    async fn cancelled_rejection_passes() {
        let limiter = RecordingLimiter::default().on_check("per-ip", exceeded("per-ip"));
        let passes = Arc::new(AtomicUsize::new(0));

        let manager = builder(CONFIG, &limiter)
            .on_limit(|parts, _, bucket| {
                assert_eq!(bucket, "per-ip");

                if parts.headers.contains_key("x-vip") {
                    LimitDecision::Cancel
                } else {
                    LimitDecision::Reject
                }
            })
            .on_pass({
                let passes = passes.clone();
                move |_| {
                    passes.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .await
            .unwrap();

        let mut parts = request("/anything");
        parts.headers.insert("x-vip", "1".parse().unwrap());

        let admission = admit(&manager, &mut parts).await;

        assert!(matches!(admission, Admission::Passed));
        assert!(!parts.extensions.get::<LimitingState>().unwrap().is_limited());
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        let mut parts = request("/anything");
        assert!(matches!(admit(&manager, &mut parts).await, Admission::Limited(_)));
        assert_eq!(passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn storage_failure_fails_open() {
        let limiter = RecordingLimiter::default().on_check(
            "login",
            Behavior::Fail(LimiterError::Storage(StorageError::Connection("refused".to_string()))),
        );

        let manager = builder(CONFIG, &limiter).build().await.unwrap();

        let mut parts = request("/login");
        let admission = admit(&manager, &mut parts).await;

        assert!(admission.is_admitted());
        assert!(matches!(admission, Admission::FailedOpen(LimiterError::Storage(_))));
        assert!(!parts.extensions.get::<LimitingState>().unwrap().is_limited());
    }

    #[tokio::test]
    async fn identity_failure_fails_open_without_state() {
        let limiter = RecordingLimiter::default();
        let manager = builder(CONFIG, &limiter).build().await.unwrap();

        let (mut parts, _) = Request::builder().uri("/login").body(()).unwrap().into_parts();
        let admission = admit(&manager, &mut parts).await;

        assert!(matches!(admission, Admission::FailedOpen(LimiterError::Identity(_))));
        assert!(parts.extensions.get::<LimitingState>().is_none());
        assert!(limiter.checks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_wins_over_slower_checks() {
        let limiter = RecordingLimiter::default()
            .on_check("login", Behavior::Delay(Duration::from_millis(200)))
            .on_check("per-ip", exceeded("per-ip"));

        let manager = builder(CONFIG, &limiter).build().await.unwrap();

        let mut parts = request("/login");
        let admission = admit(&manager, &mut parts).await;

        let Admission::Limited(rejection) = admission else {
            unreachable!("per-ip must reject");
        };

        assert_eq!(rejection.bucket, "per-ip");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_continues_by_default() {
        let limiter = RecordingLimiter::default().on_check("per-ip", Behavior::Delay(Duration::from_secs(5)));
        let timeouts = Arc::new(AtomicUsize::new(0));

        let manager = builder(CONFIG, &limiter)
            .on_event({
                let timeouts = timeouts.clone();
                move |event| {
                    if matches!(event, LimitEvent::CheckTimedOut { .. }) {
                        timeouts.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
            .build()
            .await
            .unwrap();

        let mut parts = request("/anything");
        let admission = admit(&manager, &mut parts).await;

        assert!(matches!(admission, Admission::FailedOpen(LimiterError::Timeout { .. })));
        assert!(admission.is_admitted());
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_when_configured() {
        let limiter = RecordingLimiter::default().on_check("per-ip", Behavior::Delay(Duration::from_secs(5)));
        let toml = CONFIG.replace("paths = [\"/health\"]", "paths = [\"/health\"]\n\n[rate_limit.timeout]\non_timeout = \"reject\"");

        let manager = builder(&toml, &limiter).build().await.unwrap();

        let mut parts = request("/anything");
        let admission = admit(&manager, &mut parts).await;

        let Admission::Refused { status, .. } = admission else {
            unreachable!("timeout must reject");
        };

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(parts.extensions.get::<LimitingState>().unwrap().is_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_hook_overrides_configuration() {
        let limiter = RecordingLimiter::default().on_check("per-ip", Behavior::Delay(Duration::from_secs(5)));

        let manager = builder(CONFIG, &limiter)
            .on_timeout(|_, error| {
                assert!(error.is_timeout());
                TimeoutDecision::Reject(StatusCode::GATEWAY_TIMEOUT)
            })
            .build()
            .await
            .unwrap();

        let mut parts = request("/anything");

        assert!(matches!(
            admit(&manager, &mut parts).await,
            Admission::Refused {
                status: StatusCode::GATEWAY_TIMEOUT,
                ..
            }
        ));
    }
}
