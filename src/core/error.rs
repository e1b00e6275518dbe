use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{class} '{id}' not found")]
    NotFound { class: String, id: String },

    #[error("Corrupted metadata at '{}': {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },

    #[error("Unsupported metadata version {found} at '{}' (supported up to {supported})", path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("Timed out after {waited_ms}ms waiting for lock {target}")]
    LockTimeout { target: String, waited_ms: u64 },

    #[error("Lock {target} is held by another owner")]
    LockBusy { target: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Hypervisor unavailable: {0}")]
    Unavailable(String),

    #[error("Hypervisor error {code}: {message}")]
    Hypervisor { code: i32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn not_found(class: impl ToString, id: impl Into<String>) -> Self {
        Self::NotFound {
            class: class.to_string(),
            id: id.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for failures that a later acquisition attempt might not hit.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::LockBusy { .. })
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
