use std::error::Error as StdError;

use meshvault_locks::LockManagerError;
use meshvault_storage::StorageError;
use thiserror::Error;

/// Boxed error raised by a collaborator.
pub type SourceError = Box<dyn StdError + Send + Sync>;

/// Result type for coordinator operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the coordinator.
#[derive(Debug, Error)]
pub enum Error {
    /// A file that completed its first propagation was added again.
    #[error("file {0} already completed its first propagation")]
    FileAlreadyExists(String),

    /// Not enough eligible online nodes to form or repair a group.
    #[error("insufficient nodes: {available} available, {required} required")]
    InsufficientNodes {
        /// Nodes found.
        available: usize,
        /// Nodes needed.
        required: usize,
    },

    /// A caller supplied a malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A task is in a state that does not allow the request.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The lock service failed.
    #[error("lock service error: {0}")]
    Lock(#[source] SourceError),

    /// The lock was not acquired within its wait budget.
    #[error("lock `{0}` unavailable")]
    LockUnavailable(String),

    /// A group, file, task or node does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The persistence layer failed.
    #[error("persistence error: {0}")]
    Persistence(#[source] SourceError),

    /// Another node is already propagating the file in the group.
    #[error("file {md5} is already being propagated in group {group}")]
    TaskInProgress {
        /// Group id.
        group: String,
        /// Content hash.
        md5: String,
    },
}

impl Error {
    /// Wraps a persistence failure.
    pub fn persistence<E: StorageError>(error: E) -> Self {
        Self::Persistence(Box::new(error))
    }

    /// Wraps a lock service failure.
    pub fn lock<E: LockManagerError>(error: E) -> Self {
        Self::Lock(Box::new(error))
    }

    /// Missing entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Illegal state for the request.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether retrying later may succeed without any change on the caller's
    /// side.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockUnavailable(_) | Self::TaskInProgress { .. } | Self::InsufficientNodes { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(Error::LockUnavailable("g".to_string()).is_transient());
        assert!(
            Error::TaskInProgress {
                group: "g".to_string(),
                md5: "m".to_string(),
            }
            .is_transient()
        );
        assert!(!Error::not_found("group g").is_transient());
        assert!(!Error::InvalidArgument("md5".to_string()).is_transient());
        assert!(!Error::invalid_state("task 1 finished").is_transient());
    }
}
