use thiserror::Error;

/// Errors produced by the volatile filesystem.
///
/// `Busy` is the only variant callers are expected to retry; everything else
/// propagates upward as a failed I/O operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    /// Open without create on a missing filename, or delete of a missing file.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Lock conflict, open-exclusive on an existing file, delete of an open
    /// file, or a checkpoint attempted while write transactions are in flight.
    /// Always retryable by the caller.
    #[error("resource busy: {0}")]
    Busy(String),

    /// Malformed offset, length, or size passed by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Page or shared-memory region allocation failure. Fatal to the
    /// operation; surfaced to the engine as an I/O error.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Internal invariant violation. Should not occur under correct locking
    /// discipline and indicates a bug.
    #[error("corrupt file state: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, VfsError>;
