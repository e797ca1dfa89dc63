//! # Retry
//!
//! `RetryPolicy` bounds how many times a merged record is offered to the sink and how long we
//! wait between attempts.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A retry policy to determine how deliveries are retried.
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past retry.
    pub backoff_coefficient: u32,
    /// The backoff interval before the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// The plain exponential backoff before retry number `retry` (1-based), saturating at
    /// `Duration::MAX`.
    pub fn backoff_step(&self, retry: u32) -> time::Duration {
        self.backoff_coefficient
            .checked_pow(retry.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(time::Duration::MAX)
    }

    /// Determine how long to wait before retry number `retry` (1-based).
    ///
    /// `preferred_retry_interval` is respected when it is at least this retry's backoff step,
    /// below the next one and no longer than `maximum_interval`. Waits therefore keep growing
    /// from one retry to the next whatever the sink asks for.
    pub fn retry_interval(
        &self,
        retry: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval = match self.maximum_interval {
            Some(max_interval) => std::cmp::min(self.backoff_step(retry), max_interval),
            None => self.backoff_step(retry),
        };
        let next_interval = self.backoff_step(retry.saturating_add(1));

        match preferred_retry_interval {
            Some(duration)
                if candidate_interval <= duration
                    && duration < next_interval
                    && !matches!(self.maximum_interval, Some(max) if duration > max) =>
            {
                duration
            }
            _ => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(2),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
