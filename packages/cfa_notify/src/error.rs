use thiserror::Error;

/// Failures reported by a [`KeyValueStore`](crate::KeyValueStore) backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend does not implement the requested operation
    #[error("operation not supported by store: {0}")]
    Unsupported(&'static str),
    /// The backend failed to read or write
    #[error("store I/O failed: {0}")]
    Io(String),
}

/// Failures of the remote achievement lookup. All variants are treated the
/// same by the auto updater: the fetch failed and will be retried later.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("{status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("malformed response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    /// The store lacks a capability this component needs
    #[error("unsupported store: {0}")]
    UnsupportedStore(String),

    #[error("auto updater already running")]
    AlreadyRunning,

    #[error("callback already set, clear it first")]
    AlreadyRegistered,

    #[error("notification already pending")]
    AlreadyPending,

    #[error("achievement fetch failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("stored value is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T, E = NotifyError> = std::result::Result<T, E>;
