//! The error taxonomy shared across the sync pipeline.
//!
//! Kinds are transport-agnostic: connector drivers fold HTTP status codes and
//! network failures into them, and the job queue consults [`WsError::is_retryable`]
//! to decide whether a failed execution is worth another attempt.

use thiserror::Error;

/// Errors produced anywhere in the sync pipeline.
#[derive(Debug, Error)]
pub enum WsError {
    /// Missing or invalid configuration: unknown connector kind, unknown
    /// transformation, malformed cron expression, invalid sync filter,
    /// missing mappings. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The vault could not authenticate a stored credential blob. The caller
    /// must prompt the user to re-enter credentials; retrying cannot help.
    #[error("stored credentials could not be decrypted; re-enter the connector credentials")]
    CredentialDecrypt,

    /// The remote system rejected our credentials (401/403). Not retryable;
    /// further calls on the same driver are pointless for this execution.
    #[error("remote authentication failed: {0}")]
    RemoteAuth(String),

    /// Network failure, 5xx, or rate limiting. Retryable with backoff at the
    /// job level; within an execution the item is recorded and skipped.
    #[error("transient remote error: {0}")]
    RemoteTransient(String),

    /// An explicitly requested work item does not exist on the remote.
    #[error("work item not found: {0}")]
    ItemNotFound(String),

    /// The driver does not advertise the requested capability.
    #[error("operation not supported by this connector: {0}")]
    NotSupported(&'static str),

    /// A mapping referenced a transformation name that is not registered.
    #[error("unknown transformation: {0}")]
    TransformUnknown(String),

    /// The job queue is at capacity. Callers must not retry blindly.
    #[error("job queue is full")]
    QueueFull,

    /// Engine-internal invariant violation. Fails the execution and is
    /// re-raised to the job so the retry policy can inspect it.
    #[error("execution failure: {0}")]
    Execution(String),

    /// Persistence-layer failure.
    #[error("store error: {0}")]
    Store(String),

    /// Cryptographic failure other than tag verification (key derivation,
    /// random generation, malformed ciphertext encoding).
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl WsError {
    /// Whether the job queue should retry a failed execution caused by this
    /// error. Only transient remote failures qualify; auth, decryption, and
    /// validation errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WsError::RemoteTransient(_))
    }
}

impl From<tokio_rusqlite::Error> for WsError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        WsError::Store(err.to_string())
    }
}

impl From<rusqlite::Error> for WsError {
    fn from(err: rusqlite::Error) -> Self {
        WsError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for WsError {
    fn from(err: serde_json::Error) -> Self {
        WsError::Store(format!("serialization: {err}"))
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, WsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(WsError::RemoteTransient("503".into()).is_retryable());
        assert!(!WsError::RemoteAuth("401".into()).is_retryable());
        assert!(!WsError::CredentialDecrypt.is_retryable());
        assert!(!WsError::Configuration("bad cron".into()).is_retryable());
        assert!(!WsError::QueueFull.is_retryable());
    }

    #[test]
    fn credential_decrypt_message_is_actionable() {
        let msg = WsError::CredentialDecrypt.to_string();
        assert!(msg.contains("re-enter"));
    }
}
