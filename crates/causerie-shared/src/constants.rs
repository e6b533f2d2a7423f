/// Separator for deterministic 1:1 conversation ids.
pub const DIRECT_CONVERSATION_SEPARATOR: &str = "--";

/// Maximum automatic send attempts before a message is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Exponential backoff base delay in seconds.
pub const BACKOFF_BASE_SECS: u64 = 1;

/// Exponential backoff ceiling in seconds.
pub const BACKOFF_CAP_SECS: u64 = 30;

/// Upper bound of the random jitter added to each backoff delay, in
/// milliseconds.
pub const BACKOFF_JITTER_MS: u64 = 500;

/// Timeout for a single remote send attempt, in seconds.  A timeout is
/// treated as a transient network failure.
pub const SEND_TIMEOUT_SECS: u64 = 30;

/// Age after which a Pending/Sent message is presumed crash-affected and
/// picked up by the startup recovery scan, in seconds.
pub const STALENESS_THRESHOLD_SECS: u64 = 60;
