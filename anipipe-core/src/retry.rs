use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::config::{DownloadSection, PublishSection};
use crate::error::ConfigError;

/// Delay schedule between attempts. `attempt` is the 1-based number of the
/// attempt that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Linear { step: Duration },
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self::new(max_attempts, Backoff::Linear { step })
    }

    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self::new(max_attempts, Backoff::Exponential { base, cap })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn run<F, Fut, T, E>(&self, label: &str, operation: F) -> Result<RetryOutcome<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(label, |_| true, operation).await
    }

    /// Runs `operation` until it succeeds, the attempt budget is spent, or
    /// `retryable` rejects the error. The operation receives the 1-based
    /// attempt number.
    pub async fn run_if<P, F, Fut, T, E>(
        &self,
        label: &str,
        retryable: P,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, E>
    where
        P: Fn(&E) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1u32;
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt,
                    })
                }
                Err(error) if attempt >= self.max_attempts || !retryable(&error) => {
                    warn!(attempt, stage = label, error = %error, "giving up");
                    return Err(error);
                }
                Err(error) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(attempt, wait = ?delay, stage = label, error = %error, "retrying operation");
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl TryFrom<&DownloadSection> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(section: &DownloadSection) -> Result<Self, Self::Error> {
        if section.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "download.max_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(Self::exponential(
            section.max_attempts,
            Duration::from_secs(1),
            Duration::from_secs(section.backoff_cap_seconds),
        ))
    }
}

impl TryFrom<&PublishSection> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(section: &PublishSection) -> Result<Self, Self::Error> {
        if section.upload_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "publish.upload_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(Self::linear(
            section.upload_attempts,
            Duration::from_secs(section.upload_backoff_step_seconds),
        ))
    }
}
