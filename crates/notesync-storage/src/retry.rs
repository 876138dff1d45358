//! Retry classification and exponential backoff shared by every external call.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Worth retrying; the remote end is overloaded or flaky.
    Retryable,
    /// Explicit throttling. Retried, and counted against the circuit breaker.
    RateLimited,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Backoff with the randomized share drawn uniformly from `[0, jitter * delay]`
    /// and subtracted, so jitter never pushes a wait past `max_delay`.
    pub fn jittered_delay(&self, attempt_index: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.mul_f64(jitter);
        let cut = rand::thread_rng().gen_range(0.0..=1.0);
        delay.saturating_sub(spread.mul_f64(cut))
    }

    /// Wait before the next attempt, honoring a server-provided `Retry-After`.
    pub fn wait_before_retry(&self, attempt_index: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.jittered_delay(attempt_index);
        match retry_after {
            Some(hint) => backoff.max(hint.min(self.max_delay)),
            None => backoff,
        }
    }
}
