//! Deadlines for limiter calls.

use std::{future::Future, time::Duration};

use config::TimeoutConfig;
use tokio::time::Instant;

use crate::error::LimiterError;

/// Bounds a single limiter call.
///
/// When the deadline passes the caller gets [`LimiterError::Timeout`] while the call keeps
/// running on its own task. It may still update the counters; its result is dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    timeout: Option<Duration>,
}

impl Deadline {
    /// `None` passes calls through unbounded.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Builds the deadline from configuration.
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self::new(config.enabled.then_some(config.timeout))
    }

    /// The configured deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Runs the call under the deadline.
    pub async fn run<F, T>(&self, call: F) -> Result<T, LimiterError>
    where
        F: Future<Output = Result<T, LimiterError>> + Send + 'static,
        T: Send + 'static,
    {
        let Some(timeout) = self.timeout else {
            return call.await;
        };

        let started = Instant::now();
        let handle = tokio::spawn(call);

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => Err(LimiterError::Aborted(error.to_string())),
            Err(_) => Err(LimiterError::Timeout {
                elapsed: started.elapsed(),
                timeout,
            }),
        }
    }
}
