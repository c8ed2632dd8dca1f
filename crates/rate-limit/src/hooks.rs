//! Callbacks and observability events.

use std::sync::Arc;

use http::{StatusCode, request::Parts};

use crate::{
    error::LimiterError,
    limiter::{Consumed, Rejection},
};

/// Answer of the `on_limit` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    /// Reject with 429.
    Reject,
    /// Admit the request anyway.
    Cancel,
}

/// Answer of the `on_timeout` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    /// Admit the request.
    Continue,
    /// Respond with the given status.
    Reject(StatusCode),
}

/// Decision reported by the coordinators.
#[derive(Debug, Clone)]
pub enum LimitEvent {
    /// Limiting did not apply to the request.
    Skipped,
    /// Every check passed.
    Passed {
        /// Checked buckets.
        buckets: Vec<String>,
    },
    /// The request was rejected.
    Limited {
        /// Why.
        rejection: Rejection,
    },
    /// The `on_limit` hook vetoed a rejection.
    LimitCancelled {
        /// The vetoed rejection.
        rejection: Rejection,
    },
    /// A check failed and the request was admitted.
    CheckFailed {
        /// The failure.
        error: LimiterError,
    },
    /// A check ran past its deadline.
    CheckTimedOut {
        /// The timeout error.
        error: LimiterError,
    },
    /// A response was counted against a bucket.
    Settled {
        /// The bucket.
        bucket: String,
        /// Counter state after the consume.
        consumed: Consumed,
    },
    /// The matching bucket was already exhausted when the response was counted.
    SettleExhausted {
        /// The limiter's answer.
        rejection: Rejection,
    },
    /// Counting the response failed.
    SettleFailed {
        /// The bucket.
        bucket: String,
        /// The failure.
        error: LimiterError,
    },
    /// Counting the response ran past its deadline.
    SettleTimedOut {
        /// The bucket.
        bucket: String,
        /// The timeout error.
        error: LimiterError,
    },
    /// No bucket matched the response status.
    Unsettled {
        /// The response status.
        status: StatusCode,
    },
}

/// Called with the request, the rejection and the bucket name before a 429 is sent.
pub type LimitHook = Arc<dyn Fn(&Parts, &Rejection, &str) -> LimitDecision + Send + Sync>;
/// Called when every check passed.
pub type PassHook = Arc<dyn Fn(&Parts) + Send + Sync>;
/// Overrides the configured reaction to a timed out check.
pub type TimeoutHook = Arc<dyn Fn(&Parts, &LimiterError) -> TimeoutDecision + Send + Sync>;
/// Receives every [`LimitEvent`].
pub type EventHook = Arc<dyn Fn(&LimitEvent) + Send + Sync>;
/// Extra exclusion predicate, OR'ed with the configured one.
pub type ExcludeHook = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

#[derive(Default, Clone)]
pub(crate) struct Hooks {
    pub on_limit: Option<LimitHook>,
    pub on_pass: Option<PassHook>,
    pub on_timeout: Option<TimeoutHook>,
    pub on_event: Option<EventHook>,
}
