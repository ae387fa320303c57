use std::time::Duration;

/// Delay before each retry, in milliseconds. 24 entries give 25 attempts.
pub const DEFAULT_RETRY_DELAYS: [u64; 24] = [
    0, 1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536,
    2048, 3072,
];

/// Messages that fail a call immediately when matched exactly.
const IMMEDIATE_FAIL_EXACT: [&str; 6] = [
    "invalid password",
    "empty password",
    "empty connect username",
    "Connection attempted with invalid password",
    "Connection attempted with empty password",
    "Connection attempted with empty connect username",
];

/// Messages that fail a call immediately when matched as a prefix.
const IMMEDIATE_FAIL_PREFIX: [&str; 2] = ["Unable to find ", "Not allowed to switch users from "];

/// Authentication and authorization failures are never retried.
pub fn is_immediate_fail_message(message: &str) -> bool {
    IMMEDIATE_FAIL_EXACT.contains(&message)
        || IMMEDIATE_FAIL_PREFIX
            .iter()
            .any(|prefix| message.starts_with(prefix))
}

/// Fixed ascending backoff schedule shared by every retryable call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_millis).collect())
    }

    pub fn max_attempts(&self, allow_retry: bool) -> usize {
        if allow_retry { self.delays.len() + 1 } else { 1 }
    }

    /// Delay slept after the failed `attempt` (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        self.delays
            .get(attempt.saturating_sub(1))
            .copied()
            .unwrap_or_default()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_RETRY_DELAYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_gives_25_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(true), 25);
        assert_eq!(policy.max_attempts(false), 1);
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(policy.delay(24), Duration::from_millis(3072));
    }

    #[test]
    fn schedule_is_ascending() {
        let policy = RetryPolicy::default();
        assert!(policy.delays().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn immediate_fail_messages() {
        assert!(is_immediate_fail_message("invalid password"));
        assert!(is_immediate_fail_message(
            "Connection attempted with empty connect username"
        ));
        assert!(is_immediate_fail_message("Unable to find Administrator: bob"));
        assert!(is_immediate_fail_message(
            "Not allowed to switch users from alice to bob"
        ));
        assert!(!is_immediate_fail_message("invalid password, try again"));
        assert!(!is_immediate_fail_message("connection reset by peer"));
    }
}
