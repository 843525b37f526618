use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// Allocation failures are reported as `NoSpace` rather than an I/O error so
/// callers can distinguish a full disk from a broken device. Malformed on-disk
/// structures are reported as `Corruption` instead of being skipped.
#[derive(Error, Debug)]
pub enum FsError {
    /// The request was rejected before any state changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A backing block could not be read or written. Fatal to the current
    /// call; no retry happens at this layer.
    #[error("storage error")]
    Io(#[from] std::io::Error),
    /// The relevant bitmap is exhausted.
    #[error("no space left on device")]
    NoSpace,
    /// A directory entry with the same name already exists.
    #[error("entry already exists")]
    AlreadyExists,
    /// No entry or live inode matched the request.
    #[error("no such entry")]
    NotFound,
    /// An on-disk structure failed validation.
    #[error("corrupt on-disk structure: {0}")]
    Corruption(String),
    /// A block-pointer chain kept changing underneath the walker and the
    /// retry cap was reached.
    #[error("block chain changed too many times under concurrent updates")]
    Contention,
}

pub type Result<T> = std::result::Result<T, FsError>;
