use thiserror::Error;

pub type CloudfsResult<T> = Result<T, CloudfsError>;

/// Error taxonomy surfaced by the core. The CLI maps these to messages and
/// exit codes; nothing below the CLI prints.
#[derive(Debug, Error)]
pub enum CloudfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no usable placement for version {0}")]
    NoPlacement(i64),

    #[error("unknown provider: {0}")]
    NoProvider(String),

    #[error("no active version for entry {0}")]
    NoVersion(i64),

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: i64, actual: i64 },

    #[error("cache entry is pinned; unpin before evicting")]
    Pinned,

    #[error("operation requires explicit confirmation")]
    NeedsConfirmation,

    #[error("wrong passphrase or corrupted index")]
    WrongKey,

    #[error("index corrupt: {0}")]
    Corrupt(String),

    #[error("index busy: {0}")]
    Busy(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote failure on {provider}: {message}")]
    RemoteFailure { provider: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("limit exceeded: need {needed} bytes, {available} available")]
    LimitExceeded { needed: i64, available: i64 },

    #[error("provider {0} only accepts encrypted content")]
    EncryptionIncompatible(String),
}

impl CloudfsError {
    pub fn not_found(what: impl Into<String>) -> Self {
        CloudfsError::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        CloudfsError::InvalidInput(what.into())
    }

    pub fn remote(provider: impl Into<String>, message: impl Into<String>) -> Self {
        CloudfsError::RemoteFailure {
            provider: provider.into(),
            message: message.into(),
        }
    }
}
