use std::time::Duration;

use crate::config::RetryConfig;

/// High-level classification of a fetch failure for retry purposes.
///
/// Callers map tool exit codes, stderr messages and HTTP statuses into
/// these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out (connect/read, or the worker's wall-clock ceiling).
    Timeout,
    /// Upstream asked us to slow down (429, 503).
    Throttled,
    /// Network-level failure (connection reset, DNS, etc.).
    Connection,
    /// The egress proxy itself failed (tunnel refused, proxy auth, ...).
    Proxy,
    /// HTTP status that is retryable but not strictly throttling (5xx).
    Http5xx(u16),
    /// Unrecognised failure. Retried: most unexplained tool failures are
    /// network hiccups.
    Unknown,
    /// The content cannot be fetched no matter how often we try
    /// (unsupported URL, removed or private video, 404).
    Permanent,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Connection => "connection",
            ErrorKind::Proxy => "proxy",
            ErrorKind::Http5xx(_) => "http-5xx",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Permanent => "permanent",
        }
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff policy with caps, built from the `[retry]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay for backoff.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        let base_delay = Duration::from_secs_f64(cfg.base_delay_secs.clamp(0.0, 3600.0));
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(cfg.max_delay_secs).max(base_delay),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Compute the next backoff delay for a given attempt and error kind.
    ///
    /// `attempt` is 1-based (1 = first attempt). Returns `RetryDecision::NoRetry`
    /// when we should stop retrying.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts || !kind.is_retryable() {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(exponential_backoff(
            attempt,
            self.base_delay,
            self.max_delay,
        ))
    }
}

/// `base * 2^(step - 1)`, capped at `max`. Step 0 behaves like step 1.
pub fn exponential_backoff(step: u32, base: Duration, max: Duration) -> Duration {
    let exp = 1u32 << step.saturating_sub(1).min(16);
    base.saturating_mul(exp).min(max)
}

/// Delay before a job that has been denied admission `deferrals` times in a
/// row is considered again. Zero deferrals means no delay.
pub fn admission_backoff(deferrals: u32, base: Duration, max: Duration) -> Duration {
    if deferrals == 0 {
        return Duration::ZERO;
    }
    exponential_backoff(deferrals, base, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }

    #[test]
    fn no_retry_for_permanent() {
        assert_eq!(policy().decide(1, ErrorKind::Permanent), RetryDecision::NoRetry);
    }

    #[test]
    fn unknown_errors_are_retried() {
        assert!(matches!(
            policy().decide(1, ErrorKind::Unknown),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn exponential_backoff_grows_and_is_capped() {
        let mut p = policy();
        p.max_attempts = 20;
        assert_eq!(
            p.decide(1, ErrorKind::Timeout),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            p.decide(2, ErrorKind::Proxy),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(
            p.decide(10, ErrorKind::Connection),
            RetryDecision::RetryAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn respects_max_attempts() {
        let p = policy();
        assert!(matches!(
            p.decide(1, ErrorKind::Throttled),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            p.decide(2, ErrorKind::Http5xx(502)),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(p.decide(3, ErrorKind::Throttled), RetryDecision::NoRetry);
    }

    #[test]
    fn admission_backoff_is_pure_and_bounded() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        assert_eq!(admission_backoff(0, base, max), Duration::ZERO);
        assert_eq!(admission_backoff(1, base, max), Duration::from_millis(500));
        assert_eq!(admission_backoff(2, base, max), Duration::from_secs(1));
        assert_eq!(admission_backoff(4, base, max), Duration::from_secs(4));
        assert_eq!(admission_backoff(40, base, max), max);
        assert_eq!(admission_backoff(u32::MAX, base, max), max);
        // Same input, same output.
        assert_eq!(admission_backoff(3, base, max), admission_backoff(3, base, max));
    }

    #[test]
    fn policy_from_config() {
        let cfg = RetryConfig {
            max_attempts: 0,
            base_delay_secs: 0.5,
            max_delay_secs: 10,
        };
        let p = RetryPolicy::from(&cfg);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.base_delay, Duration::from_millis(500));
        assert_eq!(p.max_delay, Duration::from_secs(10));
        // A single allowed attempt never retries.
        assert_eq!(p.decide(1, ErrorKind::Timeout), RetryDecision::NoRetry);
    }
}
