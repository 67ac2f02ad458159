//! Error taxonomy shared by the writer, reader and watcher.

use thiserror::Error;

/// Failure reported by a [`RemoteStore`](crate::store::RemoteStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("permission denied at {0}")]
    PermissionDenied(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("listener cancelled by the store")]
    Cancelled,
}

/// A logical path segment that cannot be expressed as a store key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path segment {index} is empty")]
    EmptySegment { index: usize },

    #[error("path segment {index} encodes to {len} bytes, limit is {max}")]
    SegmentTooLong { index: usize, len: usize, max: usize },
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error("unable to create new document key under {parent}: {reason}")]
    KeyGeneration { parent: String, reason: String },

    #[error("batched update rejected: {0}")]
    Commit(#[source] StoreError),

    #[error("internal error - transaction at {key} failed: {reason}")]
    Transaction { key: String, reason: String },

    #[error("take failed - {key} already taken")]
    AlreadyClaimed { key: String },

    #[error("read failed: {0}")]
    Read(#[source] StoreError),

    #[error("subscription failed: {0}")]
    Subscription(#[source] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
