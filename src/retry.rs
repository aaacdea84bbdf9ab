//! Exponential backoff with a cumulative budget per request.

use std::time::Duration;

/// Retry policy: `delay = min(base * 2^retries, budget/4)`, capped so no
/// single wait eats the whole budget. A request whose cumulative backoff
/// would reach the budget fails instead of retrying.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_backoff: Duration,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`; `cumulative` is the new
    /// total backoff to record.
    Retry { delay: Duration, cumulative: f64 },
    /// Budget spent; mark the request failed.
    Exhausted,
}

impl RetryPolicy {
    pub fn decide(&self, retry_count: i64, cumulative_backoff: f64) -> RetryDecision {
        let base = self.base_delay.as_secs_f64();
        let exponent = retry_count.clamp(0, 62) as u32;
        let raw = base * 2f64.powi(exponent as i32);
        let max_individual = self.max_backoff.as_secs_f64() / 4.0;
        let delay = raw.min(max_individual);

        let cumulative = cumulative_backoff + delay;
        if cumulative >= self.max_backoff.as_secs_f64() {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: Duration::from_secs_f64(delay),
                cumulative,
            }
        }
    }
}
