//! Error types for voicenotes.

use crate::ledger::types::MessageState;

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for a reconciliation run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("file system error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to handle update {update_id}: {source}")]
    Update {
        update_id: i64,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to process message {message_id}: {source}")]
    Message {
        message_id: i64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether the next scheduled invocation may succeed without intervention.
    ///
    /// Platform and file-system failures leave the ledger at a valid resume
    /// point. Storage, contract and configuration failures need a human, and
    /// so does a request the platform refuses outright.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Platform(error) => !error.is_rejection(),
            Error::FileSystem { .. } => true,
            Error::Update { source, .. } | Error::Message { source, .. } => {
                source.is_transient()
            }
            Error::Ledger(_) | Error::Store(_) | Error::Config(_) => false,
        }
    }

    pub(crate) fn file_system(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileSystem {
            path: path.into(),
            source,
        }
    }
}

/// Durable state medium errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state storage unavailable at {}: {reason}", path.display())]
    Unavailable { path: PathBuf, reason: String },

    #[error("corrupt state entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("cursor regression: persisted {current}, attempted {attempted}")]
    CursorRegression { current: i64, attempted: i64 },

    #[error("state database error: {0}")]
    Backend(#[from] redb::Error),
}

impl StoreError {
    /// Adapter for the several redb error types that all widen into `redb::Error`.
    pub(crate) fn backend(error: impl Into<redb::Error>) -> Self {
        StoreError::Backend(error.into())
    }
}

/// Message ledger contract errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("message {0} is not tracked")]
    NotFound(i64),

    #[error("message {0} is already tracked")]
    AlreadyExists(i64),

    #[error("invalid transition for message {message_id}: cannot {action} while {from}")]
    InvalidTransition {
        message_id: i64,
        from: MessageState,
        action: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Chat platform client errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform unreachable: {0}")]
    Unreachable(String),

    #[error("platform rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("platform API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("invalid platform response: {0}")]
    InvalidResponse(String),
}

impl PlatformError {
    /// The platform understood the request and refused it (4xx other than
    /// rate limiting). Repeating it unchanged will not help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, PlatformError::Api { code, .. } if *code < 500)
    }
}

/// Configuration and secrets loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
