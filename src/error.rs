//! Error types for chandrive.

use thiserror::Error;

/// Common error type for chandrive.
#[derive(Error, Debug)]
pub enum DriveError {
    /// The declared upload size cannot be carried by any tier within the
    /// maximum chunk count.
    #[error("size unsupported: {declared} bytes exceeds capacity of {capacity} bytes")]
    SizeUnsupported {
        /// Declared upload size.
        declared: u64,
        /// Largest size the tier table can carry.
        capacity: u64,
    },

    /// A live entry already occupies the destination name.
    #[error("name conflict: {0} already exists")]
    NameConflict(String),

    /// Resource not found (node, blob, or remote chunk).
    #[error("{0} not found")]
    NotFound(String),

    /// Parent path does not resolve to a live directory.
    #[error("parent directory not found: {0}")]
    ParentNotFound(String),

    /// A soft-deleted node cannot be brought back to its original place.
    #[error("cannot restore {0}: original location is unavailable")]
    RestoreConflict(String),

    /// A directory move would place it inside its own subtree.
    #[error("cannot move {node} into {destination}: destination is inside the node")]
    CycleDetected {
        /// Path of the node being moved.
        node: String,
        /// Requested destination directory.
        destination: String,
    },

    /// Transient transport failure; safe to retry.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Non-retryable transport refusal (size/tier mismatch).
    #[error("transport rejected: {0}")]
    TransportRejected(String),

    /// A single chunk failed to transfer.
    #[error("chunk {index} failed: {source}")]
    Chunk {
        /// Sequence index of the failing chunk.
        index: u32,
        /// Underlying failure.
        #[source]
        source: Box<DriveError>,
    },

    /// The upload stream did not match its declared size.
    #[error("size mismatch: declared {declared} bytes, stream carried {actual}")]
    SizeMismatch {
        /// Declared upload size.
        declared: u64,
        /// Bytes actually read (may stop counting one past the declared size).
        actual: u64,
    },

    /// Purge was requested for a node that is not in the recycle bin.
    #[error("node {0} is not deleted")]
    NotDeleted(String),

    /// Validation error for user input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Database error.
    ///
    /// Database errors from sqlx are automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DriveError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriveError::TransportUnavailable(_) => true,
            DriveError::Chunk { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Index of the failing chunk, if this error came from a chunk transfer.
    pub fn chunk_index(&self) -> Option<u32> {
        match self {
            DriveError::Chunk { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub(crate) fn chunk(index: u32, source: DriveError) -> Self {
        DriveError::Chunk {
            index,
            source: Box::new(source),
        }
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for DriveError {
    fn from(e: sqlx::Error) -> Self {
        DriveError::Database(e.to_string())
    }
}

/// Result type alias for chandrive operations.
pub type Result<T> = std::result::Result<T, DriveError>;
