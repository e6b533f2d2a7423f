//! Retry policy for outbound sends.
//!
//! Pure functions over attempt counts and error classes; the outbound
//! processor decides *what* to do, this module decides *whether* and *when*.

use std::time::Duration;

use causerie_shared::TransportError;
use causerie_store::QueuedEntry;
use chrono::{DateTime, Utc};
use rand::Rng;

/// Cap on the backoff exponent; with a 1 s base the ceiling is reached long
/// before this, it only guards the shift against overflow.
const MAX_EXPONENT: u32 = 16;

/// Exponential backoff with jitter, plus retry eligibility.
///
/// Formula: `min(cap, base * 2^(attempt-1)) + random(0..=jitter)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
            jitter,
        }
    }

    /// Whether a message with this many recorded attempts is out of
    /// automatic retries.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Whether another attempt should be made after a failure.
    pub fn should_retry(&self, retry_count: u32, error: &TransportError) -> bool {
        error.is_transient() && !self.is_exhausted(retry_count)
    }

    /// Deterministic backoff delay after `attempt` failed attempts
    /// (`attempt >= 1`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let secs = self.base.as_secs().saturating_mul(1u64 << exp);
        Duration::from_secs(secs.min(self.cap.as_secs()))
    }

    /// Backoff delay with random jitter added, for sleep scheduling.
    /// Jitter spreads reconnecting clients so they do not stampede the
    /// remote store in lockstep.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        self.delay(attempt) + self.jitter_sample()
    }

    /// A fresh random jitter value in `0..=jitter`.
    pub fn jitter_sample(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Earliest time the given queue entry may be attempted again.  Entries
    /// that have never been attempted are due immediately.
    pub fn next_attempt_at(&self, entry: &QueuedEntry) -> DateTime<Utc> {
        match entry.last_attempt_at {
            None => entry.created_at,
            Some(last) => {
                let delay = chrono::Duration::from_std(self.delay(entry.retry_count))
                    .unwrap_or_else(|_| chrono::Duration::seconds(self.cap.as_secs() as i64));
                last + delay
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use causerie_shared::{MessageId, MessagePayload};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::ZERO,
        )
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = policy();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(60), Duration::from_secs(30));
    }

    #[test]
    fn jitter_creates_variance() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_millis(5000),
        );

        let delays: Vec<Duration> = (0..20).map(|_| policy.delay_with_jitter(3)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();

        // With 0-5000 ms of jitter over 20 samples, identical extremes are
        // vanishingly unlikely.
        assert!(
            max.as_millis() - min.as_millis() >= 100,
            "expected jitter variance, got min={min:?} max={max:?}"
        );
        // Never below the deterministic floor, never above floor + jitter.
        assert!(*min >= policy.delay(3));
        assert!(*max <= policy.delay(3) + Duration::from_millis(5000));
    }

    #[test]
    fn exhaustion_at_max_retries() {
        let policy = policy();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }

    #[test]
    fn retry_eligibility_considers_error_class() {
        let policy = policy();
        assert!(policy.should_retry(0, &TransportError::Timeout));
        assert!(!policy.should_retry(5, &TransportError::Timeout));
        assert!(!policy.should_retry(0, &TransportError::PermissionDenied("no".into())));
    }

    #[test]
    fn unattempted_entry_is_due_immediately() {
        let policy = policy();
        let entry = QueuedEntry::new(MessageId::new(), MessagePayload::text("x"), Utc::now());
        assert_eq!(policy.next_attempt_at(&entry), entry.created_at);
    }

    #[test]
    fn attempted_entry_waits_out_its_backoff() {
        let policy = policy();
        let mut entry = QueuedEntry::new(MessageId::new(), MessagePayload::text("x"), Utc::now());
        let attempted = Utc::now();
        entry.retry_count = 3;
        entry.last_attempt_at = Some(attempted);

        let due = policy.next_attempt_at(&entry);
        assert_eq!(due, attempted + chrono::Duration::seconds(4));
    }
}
