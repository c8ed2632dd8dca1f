//! Limiter double recording every call.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::LimiterError,
    identity::Identity,
    limiter::{Consumed, Limiter, Rule},
};

/// What a scripted call does.
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Fail(LimiterError),
    Delay(Duration),
}

#[derive(Default)]
struct Calls {
    rules: Vec<(String, Rule)>,
    checks: Vec<(String, Identity)>,
    consumes: Vec<(String, Identity)>,
}

#[derive(Default, Clone)]
pub(crate) struct RecordingLimiter {
    calls: Arc<Mutex<Calls>>,
    checks: HashMap<String, Behavior>,
    consumes: HashMap<String, Behavior>,
}

impl RecordingLimiter {
    pub(crate) fn on_check(mut self, bucket: &str, behavior: Behavior) -> Self {
        self.checks.insert(bucket.to_string(), behavior);
        self
    }

    pub(crate) fn on_consume(mut self, bucket: &str, behavior: Behavior) -> Self {
        self.consumes.insert(bucket.to_string(), behavior);
        self
    }

    pub(crate) fn registered(&self) -> Vec<(String, Rule)> {
        self.calls.lock().unwrap().rules.clone()
    }

    pub(crate) fn checks(&self) -> Vec<(String, Identity)> {
        self.calls.lock().unwrap().checks.clone()
    }

    /// Completed consumes.
    pub(crate) fn consumes(&self) -> Vec<(String, Identity)> {
        self.calls.lock().unwrap().consumes.clone()
    }

    async fn play(behavior: Option<&Behavior>) -> Result<(), LimiterError> {
        match behavior {
            None => Ok(()),
            Some(Behavior::Fail(error)) => Err(error.clone()),
            Some(Behavior::Delay(delay)) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Limiter for RecordingLimiter {
    fn register_rule(&self, name: &str, rule: Rule) {
        self.calls.lock().unwrap().rules.push((name.to_string(), rule));
    }

    async fn check_limited(&self, name: &str, identity: &Identity) -> Result<(), LimiterError> {
        self.calls
            .lock()
            .unwrap()
            .checks
            .push((name.to_string(), identity.clone()));

        Self::play(self.checks.get(name)).await
    }

    async fn consume(&self, name: &str, identity: &Identity) -> Result<Consumed, LimiterError> {
        Self::play(self.consumes.get(name)).await?;

        let mut calls = self.calls.lock().unwrap();
        calls.consumes.push((name.to_string(), identity.clone()));

        let max = calls
            .rules
            .iter()
            .find(|(rule, _)| rule == name)
            .map(|(_, rule)| rule.max)
            .unwrap_or(1);

        Ok(Consumed {
            count: 1,
            max,
            reset: Some(0),
        })
    }
}
