//! Bucket based admission control for HTTP request pipelines.
//!
//! A request passes through two phases:
//!
//! - [`RateLimitManager::admit`] runs before the handler. It resolves the buckets that apply to
//!   the request, checks every one of them concurrently against the [`Limiter`] and attaches a
//!   [`LimitingState`] to the request extensions.
//! - [`RateLimitManager::settle`] runs once the response status is known. It consumes a slot
//!   from the first bucket whose status patterns match the response, unless the request was
//!   already rejected.
//!
//! Limiter and storage failures never reject a request. They are logged, reported to the event
//! hook, and the request continues as if it had been admitted.

#![deny(missing_docs)]

mod admission;
mod bucket;
mod clock;
mod error;
mod hooks;
mod identity;
mod limiter;
mod manager;
mod route;
mod settlement;
mod state;
pub mod storage;
mod timeout;

#[cfg(test)]
mod testing;

pub use admission::Admission;
pub use bucket::Bucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{IdentityError, LimiterError, RateLimitError, StorageError};
pub use hooks::{EventHook, ExcludeHook, LimitDecision, LimitEvent, LimitHook, PassHook, TimeoutDecision, TimeoutHook};
pub use identity::{ClientIp, Identifier, Identity};
pub use limiter::{Consumed, Limiter, Rejection, Rule, StoreLimiter};
pub use manager::{RateLimitManager, RateLimitManagerBuilder};
pub use route::{Resolution, RouteResolver};
pub use settlement::Settlement;
pub use state::LimitingState;
pub use timeout::Deadline;
