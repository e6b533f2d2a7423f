use thiserror::Error;

/// Errors reported by the remote transport.
///
/// The sync engine only distinguishes two classes: transient failures are
/// retried with backoff, permanent ones fail the message immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The send attempt did not complete within the attempt timeout.
    #[error("remote operation timed out")]
    Timeout,

    /// The connection dropped mid-operation.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No connection is currently established.
    #[error("not connected")]
    NotConnected,

    /// The remote store rejected the caller's credentials or permissions.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The remote store rejected the payload itself.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl TransportError {
    /// Whether the operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionLost(_) | Self::NotConnected
        )
    }
}
