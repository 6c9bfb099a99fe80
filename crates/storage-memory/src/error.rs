use meshvault_storage::StorageError;
use thiserror::Error;

/// Errors from the in-memory data source.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A group with this id already exists.
    #[error("group `{0}` already exists")]
    GroupExists(String),

    /// The node is already a member of the group.
    #[error("node `{node}` is already a member of group `{group}`")]
    MemberExists {
        /// Group id.
        group: String,
        /// Node id.
        node: String,
    },

    /// The referenced group does not exist.
    #[error("group `{0}` not found")]
    UnknownGroup(String),

    /// The referenced membership does not exist.
    #[error("node `{node}` is not a member of group `{group}`")]
    UnknownMember {
        /// Group id.
        group: String,
        /// Node id.
        node: String,
    },

    /// The referenced node does not exist.
    #[error("node `{0}` not found")]
    UnknownNode(String),

    /// The referenced task does not exist.
    #[error("task {0} not found")]
    UnknownTask(u64),
}

impl StorageError for Error {}
