//! Engine configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the engine can start with zero
//! configuration.

use std::time::Duration;

use causerie_shared::constants::{
    BACKOFF_BASE_SECS, BACKOFF_CAP_SECS, BACKOFF_JITTER_MS, DEFAULT_MAX_RETRIES,
    SEND_TIMEOUT_SECS, STALENESS_THRESHOLD_SECS,
};

use crate::retry::RetryPolicy;

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum automatic send attempts before a message is marked failed.
    /// Env: `CAUSERIE_MAX_RETRIES`
    /// Default: `5`
    pub max_retries: u32,

    /// Exponential backoff base delay.
    /// Env: `CAUSERIE_BACKOFF_BASE_SECS`
    /// Default: `1s`
    pub backoff_base: Duration,

    /// Exponential backoff ceiling.
    /// Env: `CAUSERIE_BACKOFF_CAP_SECS`
    /// Default: `30s`
    pub backoff_cap: Duration,

    /// Upper bound of the random jitter added to each backoff delay.
    /// Env: `CAUSERIE_BACKOFF_JITTER_MS`
    /// Default: `500ms`
    pub backoff_jitter: Duration,

    /// Timeout for a single remote send attempt; a timeout is treated as a
    /// transient network failure.
    /// Env: `CAUSERIE_SEND_TIMEOUT_SECS`
    /// Default: `30s`
    pub send_timeout: Duration,

    /// Age after which a Pending/Sent message is presumed crash-affected.
    /// Env: `CAUSERIE_STALENESS_SECS`
    /// Default: `60s`
    pub staleness_threshold: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_secs(BACKOFF_BASE_SECS),
            backoff_cap: Duration::from_secs(BACKOFF_CAP_SECS),
            backoff_jitter: Duration::from_millis(BACKOFF_JITTER_MS),
            send_timeout: Duration::from_secs(SEND_TIMEOUT_SECS),
            staleness_threshold: Duration::from_secs(STALENESS_THRESHOLD_SECS),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.  Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_u64("CAUSERIE_MAX_RETRIES") {
            config.max_retries = n as u32;
        }
        if let Some(secs) = env_u64("CAUSERIE_BACKOFF_BASE_SECS") {
            config.backoff_base = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CAUSERIE_BACKOFF_CAP_SECS") {
            config.backoff_cap = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("CAUSERIE_BACKOFF_JITTER_MS") {
            config.backoff_jitter = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("CAUSERIE_SEND_TIMEOUT_SECS") {
            config.send_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CAUSERIE_STALENESS_SECS") {
            config.staleness_threshold = Duration::from_secs(secs);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Build the retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.backoff_base,
            self.backoff_cap,
            self.backoff_jitter,
        )
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_cap, Duration::from_secs(30));
        assert_eq!(config.send_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_retry_policy_inherits_settings() {
        let config = SyncConfig {
            max_retries: 2,
            backoff_jitter: Duration::ZERO,
            ..SyncConfig::default()
        };

        let policy = config.retry_policy();
        assert!(policy.is_exhausted(2));
        assert!(!policy.is_exhausted(1));
    }
}
