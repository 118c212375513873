use std::time;

use rand::Rng;

#[derive(Copy, Clone, Debug)]
/// The retry policy used to space out reconnect attempts to the device.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
    /// Fraction of an interval that may be shaved off at random, in `[0, 1]`.
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn maximum_interval(&self) -> time::Duration {
        self.maximum_interval
    }

    /// Calculate the time until the next retry for a given attempt, before jitter.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(self.maximum_interval);

        std::cmp::min(candidate_interval, self.maximum_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

/// Consecutive-failure state for a `RetryPolicy`.
///
/// Within one streak of failures delays never shrink, even with jitter, and never exceed the
/// policy's maximum. There is no limit on the number of attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    last_delay: Option<time::Duration>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_delay: None,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> time::Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng>(&mut self, rng: &mut R) -> time::Duration {
        let base = self.policy.time_until_next_retry(self.attempt);
        let jittered = if self.policy.jitter > 0.0 && !base.is_zero() {
            base.mul_f64(1.0 - rng.gen_range(0.0..=self.policy.jitter))
        } else {
            base
        };

        let delay = match self.last_delay {
            Some(last_delay) => std::cmp::max(jittered, last_delay),
            None => jittered,
        };
        let delay = std::cmp::min(delay, self.policy.maximum_interval);

        self.attempt = self.attempt.saturating_add(1);
        self.last_delay = Some(delay);
        delay
    }

    /// Start over from the initial interval, after the link proved healthy.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = None;
    }
}
