//! Bounded exponential backoff for provider calls; only transient failures are retried.

use crate::core::error::{ErrorClass, StoryError};
use anyhow::Result;
use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Adds up to 25% random delay on top of each backoff step.
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    2000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * multiplier^(retry-1).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let mut delay = Duration::from_millis(millis.min(u64::MAX as f64 / 2.0) as u64);
        if self.jitter && self.base_delay_ms > 0 {
            let extra = rand::rng().random_range(0..=delay.as_millis() as u64 / 4);
            delay += Duration::from_millis(extra);
        }
        delay
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Attempt counter plus the class of the last failure.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
    last_class: Option<ErrorClass>,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_class: None,
        }
    }

    pub fn start_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_class(&self) -> Option<ErrorClass> {
        self.last_class
    }

    /// Only transient failures are retried, and only while attempts remain.
    pub fn record_failure(&mut self, err: &anyhow::Error) -> RetryDecision {
        let class = StoryError::classify(err);
        self.last_class = Some(class);
        if class != ErrorClass::Transient || self.attempt >= self.policy.max_attempts.max(1) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.policy.delay_for(self.attempt))
    }
}

pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(policy);
    loop {
        let attempt = backoff.start_attempt();
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match backoff.record_failure(&err) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {:#}",
                        label, attempt, policy.max_attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    if backoff.last_class() == Some(ErrorClass::Transient) {
                        return Err(err.context(format!("{} gave up after {} attempts", label, attempt)));
                    }
                    return Err(err);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_grows_multiplicatively() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..20 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_secs(4) && d <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_backoff_state_machine() {
        let policy = fast_policy();
        let mut backoff = Backoff::new(&policy);
        let transient: anyhow::Error = StoryError::TransientService("busy".into()).into();
        for _ in 0..4 {
            backoff.start_attempt();
            assert!(matches!(backoff.record_failure(&transient), RetryDecision::Retry(_)));
        }
        backoff.start_attempt();
        assert_eq!(backoff.record_failure(&transient), RetryDecision::GiveUp);
        assert_eq!(backoff.attempt(), 5);
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() -> Result<()> {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let value = with_backoff(&fast_policy(), "fake", move |_| {
            let counter = counter.clone();
            async move {
                let mut n = counter.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    Err(anyhow::Error::from(StoryError::TransientService("overloaded".into())))
                } else {
                    Ok("done")
                }
            }
        })
        .await?;
        assert_eq!(value, "done");
        assert_eq!(*calls.lock().unwrap(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_content_policy_is_not_retried() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let result: Result<()> = with_backoff(&fast_policy(), "fake", move |_| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err(anyhow::Error::from(StoryError::ContentPolicy("unsafe prompt".into())))
            }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(StoryError::classify(&err), ErrorClass::ContentPolicy);
        assert!(err.to_string().contains("unsafe prompt"));
    }

    #[tokio::test]
    async fn test_transient_exhaustion_surfaces() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let result: Result<()> = with_backoff(&fast_policy(), "fake", move |_| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err(anyhow::Error::from(StoryError::TransientService("busy".into())))
            }
        })
        .await;
        assert_eq!(*calls.lock().unwrap(), 5);
        assert_eq!(StoryError::classify(&result.unwrap_err()), ErrorClass::Transient);
    }
}
