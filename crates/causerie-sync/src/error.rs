use causerie_shared::{MessageId, TransportError};
use causerie_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the sync engine.
///
/// Transient transport failures are absorbed by the outbound processor and
/// never reach the caller; what remains is either a storage failure (a broken
/// persistence invariant, surfaced to the application) or a terminal state
/// the UI must present.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote transport failure that could not be recovered by retrying.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local storage failure.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// The store mutex was poisoned by a panicking writer.
    #[error("Store lock poisoned")]
    LockPoisoned,

    /// Automatic retries are exhausted; the message is marked failed.
    #[error("Retry limit reached for message {0}")]
    RetryExhausted(MessageId),

    /// The requested operation is not valid for the message's current status
    /// (e.g. retrying a message that has not failed).
    #[error("Message {0} is not in a retryable state")]
    NotRetryable(MessageId),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
