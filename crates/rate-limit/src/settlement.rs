//! Settlement: the phase running once the response status is known.

use http::{HeaderMap, StatusCode};

use crate::{
    error::LimiterError,
    hooks::LimitEvent,
    limiter::{Consumed, Rejection},
    manager::RateLimitManager,
    state::LimitingState,
};

/// Outcome of [`RateLimitManager::settle`].
#[derive(Debug)]
pub enum Settlement {
    /// No state attached, or the request was rejected during admission.
    Skipped,
    /// No bucket matches the response status.
    Unmatched,
    /// The response was counted against a bucket.
    Settled {
        /// The bucket.
        bucket: String,
        /// Counter state after the consume.
        consumed: Consumed,
    },
    /// The bucket filled up since admission. The next request will be limited.
    Exhausted(Rejection),
    /// Counting failed or timed out. The response is sent unchanged.
    Failed(LimiterError),
}

impl RateLimitManager {
    /// Counts a finished request against the first bucket matching its status.
    ///
    /// Buckets are scanned in priority order. At most one bucket is consumed per request and
    /// nothing is consumed for requests rejected during admission. Rate limit headers are merged
    /// into `headers` when enabled.
    pub async fn settle(&self, state: Option<&LimitingState>, status: StatusCode, headers: &mut HeaderMap) -> Settlement {
        let Some(state) = state.filter(|state| !state.is_limited()) else {
            return Settlement::Skipped;
        };

        let matched = state.entries().iter().find_map(|(name, identity)| {
            self.buckets
                .get(name)
                .filter(|bucket| bucket.matches(status))
                .map(|bucket| (bucket, identity.clone()))
        });

        let Some((bucket, identity)) = matched else {
            self.emit(LimitEvent::Unsettled { status });
            return Settlement::Unmatched;
        };

        let name = bucket.name().to_string();

        let result = {
            let limiter = self.limiter.clone();
            let name = name.clone();

            self.deadline
                .run(async move { limiter.consume(&name, &identity).await })
                .await
        };

        match result {
            Ok(consumed) => {
                if self.include_headers {
                    for (header, value) in &bucket.headers(&consumed) {
                        headers.insert(header.clone(), value.clone());
                    }
                }

                log::debug!("Settled {status} against bucket '{name}' ({}/{})", consumed.count, consumed.max);

                self.emit(LimitEvent::Settled {
                    bucket: name.clone(),
                    consumed,
                });

                Settlement::Settled { bucket: name, consumed }
            }
            Err(LimiterError::Exceeded(rejection)) => {
                log::debug!("Bucket '{name}' was exhausted while the request was running");

                self.emit(LimitEvent::SettleExhausted {
                    rejection: rejection.clone(),
                });

                Settlement::Exhausted(rejection)
            }
            Err(error) if error.is_timeout() => {
                log::warn!("Counting the response against bucket '{name}' timed out: {error}");

                self.emit(LimitEvent::SettleTimedOut {
                    bucket: name,
                    error: error.clone(),
                });

                Settlement::Failed(error)
            }
            Err(error) => {
                log::error!("Failed to count the response against bucket '{name}': {error}");

                self.emit(LimitEvent::SettleFailed {
                    bucket: name,
                    error: error.clone(),
                });

                Settlement::Failed(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Arc,
        time::Duration,
    };

    use http::{Request, request::Parts};
    use indoc::indoc;

    use super::*;
    use crate::{
        admission::Admission,
        clock::ManualClock,
        hooks::LimitDecision,
        error::StorageError,
        identity::ClientIp,
        testing::{Behavior, RecordingLimiter},
    };

    const PRIORITY: &str = indoc! {r#"
        [rate_limit]
        enabled = true
        default = ["b1", "b2"]

        [[rate_limit.buckets]]
        name = "b1"
        interval = "1m"
        max = 10
        codes = ["4xx"]

        [[rate_limit.buckets]]
        name = "b2"
        interval = "1m"
        max = 10
    "#};

    const SMALL: &str = indoc! {r#"
        [rate_limit]
        enabled = true
        default = ["small"]

        [[rate_limit.buckets]]
        name = "small"
        interval = "1s"
        max = 2
    "#};

    fn config(toml: &str) -> config::RateLimitConfig {
        toml::from_str::<config::Config>(toml).unwrap().rate_limit
    }

    async fn recording(toml: &str, limiter: &RecordingLimiter) -> RateLimitManager {
        RateLimitManager::builder(config(toml))
            .limiter(Arc::new(limiter.clone()))
            .build()
            .await
            .unwrap()
    }

    fn request() -> Parts {
        Request::builder()
            .uri("/items")
            .extension(ClientIp(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))))
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    /// Runs both phases like the server layer does.
    async fn roundtrip(manager: &RateLimitManager, status: StatusCode) -> (Admission, Settlement, HeaderMap) {
        let mut parts = request();
        let admission = manager.admit(&mut parts, None).await;

        let mut headers = HeaderMap::new();

        if let Admission::Limited(rejection) = &admission {
            headers = rejection.headers();
        }

        let status = if admission.is_admitted() { status } else { StatusCode::TOO_MANY_REQUESTS };
        let settlement = manager
            .settle(parts.extensions.get::<LimitingState>(), status, &mut headers)
            .await;

        (admission, settlement, headers)
    }

    #[tokio::test]
    async fn first_matching_bucket_in_priority_order() {
        let limiter = RecordingLimiter::default();
        let manager = recording(PRIORITY, &limiter).await;

        let (_, settlement, _) = roundtrip(&manager, StatusCode::OK).await;
        assert!(matches!(settlement, Settlement::Settled { bucket, .. } if bucket == "b2"));

        let (_, settlement, _) = roundtrip(&manager, StatusCode::NOT_FOUND).await;
        assert!(matches!(settlement, Settlement::Settled { bucket, .. } if bucket == "b1"));

        let (_, settlement, headers) = roundtrip(&manager, StatusCode::INTERNAL_SERVER_ERROR).await;
        assert!(matches!(settlement, Settlement::Unmatched));
        assert!(headers.is_empty());

        let consumed: Vec<_> = limiter.consumes().into_iter().map(|(name, _)| name).collect();
        assert_eq!(consumed, ["b2", "b1"]);
    }

    #[tokio::test]
    async fn counts_down_and_resets_after_the_interval() {
        let clock = ManualClock::new(1_000_000);

        let manager = RateLimitManager::builder(config(SMALL))
            .clock(Arc::new(clock.clone()))
            .build()
            .await
            .unwrap();

        let (_, _, headers) = roundtrip(&manager, StatusCode::OK).await;
        assert_eq!(headers["x-ratelimit-remaining"], "1");
        assert_eq!(headers["x-rate-limit"], "2");
        assert_eq!(headers["x-ratelimit-reset"], "1001");

        let (_, _, headers) = roundtrip(&manager, StatusCode::OK).await;
        assert_eq!(headers["x-ratelimit-remaining"], "0");

        let (admission, settlement, headers) = roundtrip(&manager, StatusCode::OK).await;
        assert!(matches!(admission, Admission::Limited(_)));
        assert!(matches!(settlement, Settlement::Skipped));
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-reset"], "1001");

        clock.advance(Duration::from_secs(1));

        let (admission, _, headers) = roundtrip(&manager, StatusCode::OK).await;
        assert!(matches!(admission, Admission::Passed));
        assert_eq!(headers["x-ratelimit-remaining"], "1");
    }

    #[tokio::test]
    async fn limited_requests_are_not_counted_twice() {
        let limiter = RecordingLimiter::default().on_check(
            "b2",
            Behavior::Fail(LimiterError::Exceeded(Rejection {
                bucket: "b2".to_string(),
                reset: None,
                retry_after: Duration::from_secs(1),
            })),
        );

        let manager = recording(PRIORITY, &limiter).await;
        let (admission, settlement, _) = roundtrip(&manager, StatusCode::OK).await;

        assert!(matches!(admission, Admission::Limited(_)));
        assert!(matches!(settlement, Settlement::Skipped));
        assert!(limiter.consumes().is_empty());
    }

    #[tokio::test]
    async fn cancelled_rejection_settles_normally() {
        let limiter = RecordingLimiter::default().on_check(
            "b2",
            Behavior::Fail(LimiterError::Exceeded(Rejection {
                bucket: "b2".to_string(),
                reset: None,
                retry_after: Duration::from_secs(1),
            })),
        );

        let manager = RateLimitManager::builder(config(PRIORITY))
            .limiter(Arc::new(limiter.clone()))
            .on_limit(|_, _, _| LimitDecision::Cancel)
            .build()
            .await
            .unwrap();

        let (admission, settlement, headers) = roundtrip(&manager, StatusCode::OK).await;

        assert!(matches!(admission, Admission::Passed));
        assert!(matches!(settlement, Settlement::Settled { bucket, .. } if bucket == "b2"));
        assert_eq!(headers["x-rate-limit"], "10");

        let consumed: Vec<_> = limiter.consumes().into_iter().map(|(name, _)| name).collect();
        assert_eq!(consumed, ["b2"]);
    }

    #[tokio::test]
    async fn missing_state_is_skipped() {
        let manager = recording(PRIORITY, &RecordingLimiter::default()).await;
        let mut headers = HeaderMap::new();

        let settlement = manager.settle(None, StatusCode::OK, &mut headers).await;
        assert!(matches!(settlement, Settlement::Skipped));
    }

    #[tokio::test]
    async fn headers_can_be_disabled() {
        let limiter = RecordingLimiter::default();
        let toml = PRIORITY.replace("enabled = true", "enabled = true\ninclude_headers = false");
        let manager = recording(&toml, &limiter).await;

        let (_, settlement, headers) = roundtrip(&manager, StatusCode::OK).await;

        assert!(matches!(settlement, Settlement::Settled { .. }));
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn exhausted_bucket_is_benign() {
        let limiter = RecordingLimiter::default().on_consume(
            "b2",
            Behavior::Fail(LimiterError::Exceeded(Rejection {
                bucket: "b2".to_string(),
                reset: Some(5),
                retry_after: Duration::from_secs(1),
            })),
        );

        let manager = recording(PRIORITY, &limiter).await;
        let (admission, settlement, headers) = roundtrip(&manager, StatusCode::OK).await;

        assert!(matches!(admission, Admission::Passed));
        assert!(matches!(settlement, Settlement::Exhausted(_)));
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn storage_failure_leaves_the_response_alone() {
        let limiter = RecordingLimiter::default().on_consume(
            "b1",
            Behavior::Fail(LimiterError::Storage(StorageError::Query("READONLY".to_string()))),
        );

        let manager = recording(PRIORITY, &limiter).await;
        let (_, settlement, headers) = roundtrip(&manager, StatusCode::FORBIDDEN).await;

        assert!(matches!(settlement, Settlement::Failed(LimiterError::Storage(_))));
        assert!(headers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_consume_still_lands() {
        let limiter = RecordingLimiter::default().on_consume("b2", Behavior::Delay(Duration::from_secs(2)));
        let manager = recording(PRIORITY, &limiter).await;

        let (_, settlement, headers) = roundtrip(&manager, StatusCode::OK).await;

        assert!(matches!(settlement, Settlement::Failed(LimiterError::Timeout { .. })));
        assert!(headers.is_empty());
        assert!(limiter.consumes().is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(limiter.consumes().len(), 1);
    }
}
