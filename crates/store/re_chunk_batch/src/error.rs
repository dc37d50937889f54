use std::sync::Arc;

use crate::CancelCause;

/// Errors returned by a [`crate::Fetcher`].
#[derive(thiserror::Error, Debug, Clone)]
pub enum FetchError {
    /// The stored bytes of a chunk do not match its checksum.
    ///
    /// This is a transient storage read issue: the chunk is treated as having no data rather than
    /// failing the whole query.
    #[error("invalid checksum for chunk {key}")]
    InvalidChecksum { key: String },

    #[error("storage: {0}")]
    Storage(Arc<dyn std::error::Error + Send + Sync>),
}

impl FetchError {
    /// Wraps any storage error.
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Arc::new(err))
    }

    /// Is this the benign checksum-mismatch class of error?
    pub fn is_invalid_chunk_error(&self) -> bool {
        matches!(self, Self::InvalidChecksum { .. })
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

// ---

/// Terminal errors of a batched chunk stream.
///
/// This is [`Clone`] since the stream reports it for as long as it is asked.
#[derive(thiserror::Error, Debug, Clone)]
pub enum BatchError {
    #[error("panic while fetching chunks: {reason}")]
    Panic { reason: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("chunk {key} was iterated before being loaded")]
    ChunkNotLoaded { key: String },

    #[error("query cancelled: {0}")]
    Cancelled(CancelCause),

    #[error("failed to spawn the chunk batch planner: {0}")]
    Spawn(Arc<std::io::Error>),
}

const _: () = assert!(
    std::mem::size_of::<BatchError>() <= 64,
    "Error type is too large. Try to reduce its size by boxing some of its variants.",
);

pub type BatchResult<T> = Result<T, BatchError>;

// ---

/// Errors when reading a [`crate::BatchIteratorConfig`] from the environment.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} is not a positive integer")]
    InvalidValue {
        name: &'static str,
        value: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
