use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Backend;

/// Md5 of the DELETED record whose version bump makes members resync.
pub const PLACEHOLDER_MD5: &str = "00000000000000000000000000000000";

/// Whether a group still holds a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileState {
    /// Held by the group.
    Normal,

    /// Removed; the record stays so members learn about the removal.
    Deleted,
}

/// How a file entered its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Spread to every member, versioned by the group counter.
    FirstSpread,

    /// Pushed by a single source node, versioned by the add counter until
    /// promoted.
    NewAdd,
}

/// A file record within a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFile {
    /// Owning group.
    pub group: String,

    /// Content hash, 32 hex characters.
    pub md5: String,

    /// Size in bytes.
    pub size: u64,

    /// Group version at which the record last changed.
    pub ver: u64,

    /// Presence in the group.
    pub state: FileState,

    /// How the file entered the group.
    pub kind: FileKind,

    /// Add-counter version, only meaningful for [`FileKind::NewAdd`].
    pub add_ver: u64,

    /// Node holding the authoritative original.
    pub src_node: Option<String>,

    /// Last time the file was (re-)added (unix seconds).
    pub last_add_tm: i64,
}

impl GroupFile {
    /// Whether the group holds the file.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.state == FileState::Normal
    }

    /// Whether the file is still a pending source push.
    #[must_use]
    pub fn is_new_add(&self) -> bool {
        self.kind == FileKind::NewAdd
    }
}

/// A node's complaint about a corrupt or missing file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidFileReport {
    /// Reporting node.
    pub node: String,

    /// Group the file belongs to.
    pub group: String,

    /// Content hash.
    pub md5: String,

    /// Report time (unix seconds).
    pub tm: i64,
}

/// File ledger persistence.
#[async_trait]
pub trait FileStore: Backend {
    /// Atomically increments the counter under `key` and returns the new value.
    ///
    /// Successive calls for one key must return strictly increasing values.
    async fn next_version(&self, key: &str) -> Result<u64, Self::Error>;

    /// Current value of the counter under `key`, zero if never incremented.
    async fn current_version(&self, key: &str) -> Result<u64, Self::Error>;

    /// Fetches a file record of a group.
    async fn group_file(&self, group: &str, md5: &str) -> Result<Option<GroupFile>, Self::Error>;

    /// All records of a file across groups, ordered by group id.
    async fn files_by_md5(
        &self,
        md5: &str,
        state: Option<FileState>,
    ) -> Result<Vec<GroupFile>, Self::Error>;

    /// Inserts or replaces a file record.
    async fn put_group_file(&self, file: GroupFile) -> Result<(), Self::Error>;

    /// Removes a file record.
    async fn delete_group_file(&self, group: &str, md5: &str) -> Result<(), Self::Error>;

    /// Records of one kind changed after `after`, ascending.
    ///
    /// First-spread records are ordered by `ver`, new-add records by `add_ver`.
    async fn updated_files(
        &self,
        group: &str,
        after: u64,
        limit: usize,
        kind: FileKind,
    ) -> Result<Vec<GroupFile>, Self::Error>;

    /// NORMAL new-add records last added before `before`.
    async fn stale_new_files(&self, before: i64, limit: usize)
    -> Result<Vec<GroupFile>, Self::Error>;

    /// Nodes holding the original of a file.
    async fn source_nodes(&self, md5: &str, limit: usize) -> Result<Vec<String>, Self::Error>;

    /// Whether a node holds the original of a file.
    async fn has_source(&self, node: &str, md5: &str) -> Result<bool, Self::Error>;

    /// Stored checksum of a file.
    async fn checksum(&self, md5: &str) -> Result<Option<String>, Self::Error>;

    /// Stores the checksum of a file.
    async fn set_checksum(&self, md5: &str, checksum: &str) -> Result<(), Self::Error>;

    /// Persists an invalid-file report.
    async fn record_invalid_file(&self, report: InvalidFileReport) -> Result<(), Self::Error>;
}
