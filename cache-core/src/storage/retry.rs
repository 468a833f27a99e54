// cache-core/src/storage/retry.rs

//! Backoff policy for transient object store failures.

use std::future::Future;
use std::time::Duration;

use crate::config::S3Config;

/// Exponential backoff with optional proportional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Adds up to a quarter of the computed delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&S3Config> for RetryPolicy {
    fn from(config: &S3Config) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let delay = if self.jitter {
            capped * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    Transient(E),
    Fatal(E),
}

/// Runs `operation` until it is done, fails fatally, or the retries run out.
pub async fn with_retries<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(error) => return Err(error),
            Attempt::Transient(error) if attempt >= policy.max_retries => return Err(error),
            Attempt::Transient(error) => {
                let delay = policy.backoff(attempt);
                attempt += 1;
                tracing::warn!(
                    "Transient storage failure ({}), retry {}/{} in {:?}",
                    error,
                    attempt,
                    policy.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub(crate) fn is_transient(error: &object_store::Error) -> bool {
    let message = error.to_string();
    matches!(error, object_store::Error::Generic { .. })
        && ["timeout", "connection", "500", "502", "503"]
            .iter()
            .any(|needle| message.contains(needle))
}

/// Classifies an object store error for [`with_retries`].
pub(crate) fn classify<T>(error: object_store::Error) -> Attempt<T, object_store::Error> {
    if is_transient(&error) {
        Attempt::Transient(error)
    } else {
        Attempt::Fatal(error)
    }
}
