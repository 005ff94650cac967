//! Retry policy for remote calls.

use std::time::Duration;

/// Bounded retry with linear backoff.
///
/// `max_retries` counts attempts *after* the first one, so the default policy makes
/// at most three calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Backoff unit; retry `n` (1-based) waits `n * base_delay`.
    pub base_delay: Duration,
    /// Wait used on 429 when the server gives no usable `Retry-After`.
    pub default_rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            default_rate_limit_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry.max(1))
    }

    /// Delay before retrying a 429, never shorter than one second.
    pub fn rate_limit_delay(&self, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.max(Duration::from_secs(1)),
            None => self.default_rate_limit_delay,
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(1_500));
    }

    #[test]
    fn rate_limit_hint_has_a_floor() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_delay(None), Duration::from_secs(1));
        assert_eq!(policy.rate_limit_delay(Some(Duration::ZERO)), Duration::from_secs(1));
        assert_eq!(
            policy.rate_limit_delay(Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn retry_after_accepts_only_seconds() {
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("1.5"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after(""), None);
    }
}
