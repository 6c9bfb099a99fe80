use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Backend, Peer};

/// Piece parameters of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceProfile {
    /// Piece size in KiB.
    pub piece_size: u32,

    /// Members needed to reconstruct a file.
    pub min_pieces: u32,

    /// Online members below which the group is repaired.
    pub safe_pieces: u32,

    /// Online members the group is repaired up to.
    pub perfect_pieces: u32,
}

/// Size classes, smallest first.
pub const GROUP_PROFILES: [PieceProfile; 3] = [
    PieceProfile {
        piece_size: 1024,
        min_pieces: 32,
        safe_pieces: 48,
        perfect_pieces: 64,
    },
    PieceProfile {
        piece_size: 1024,
        min_pieces: 64,
        safe_pieces: 96,
        perfect_pieces: 128,
    },
    PieceProfile {
        piece_size: 1024,
        min_pieces: 128,
        safe_pieces: 160,
        perfect_pieces: 208,
    },
];

/// A replication group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Random fixed-length token.
    pub id: String,

    /// Index into [`GROUP_PROFILES`].
    pub class: usize,

    /// Piece parameters.
    pub profile: PieceProfile,

    /// Total bytes of NORMAL files.
    pub size: u64,

    /// Files with `ver <= first_finish_ver` completed their first propagation.
    pub first_finish_ver: u64,

    /// Version of the latest deletion.
    pub deleted_ver: u64,

    /// Creation time (unix seconds).
    pub created_tm: i64,
}

impl Group {
    /// Bytes the group can hold given the space each member lends to it.
    #[must_use]
    pub const fn capacity(&self, node_capacity: u64) -> u64 {
        self.profile.min_pieces as u64 * node_capacity
    }

    /// Whether the group accepts no more files.
    #[must_use]
    pub const fn is_full(&self, node_capacity: u64) -> bool {
        self.size >= self.capacity(node_capacity)
    }
}

/// Liveness of a node within a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    /// Reporting and up to date.
    Online,

    /// Timed out or reporting a regressed version.
    Offline,
}

/// Membership edge between a group and a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupNode {
    /// Node id.
    pub node: String,

    /// Last group version the node reported.
    pub ver: u64,

    /// Liveness within the group.
    pub state: MemberState,

    /// Highest version the node ever reported.
    pub max_ver: u64,
}

impl GroupNode {
    /// A member that just joined and holds nothing yet.
    #[must_use]
    pub fn joined(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ver: 0,
            state: MemberState::Online,
            max_ver: 0,
        }
    }

    /// Whether the member counts towards the online population.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state == MemberState::Online
    }
}

/// Space accounting of the non-full groups of one size class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassUsage {
    /// Sum of group capacities in bytes.
    pub capacity: u64,

    /// Sum of group sizes in bytes.
    pub used: u64,
}

impl ClassUsage {
    /// Free space as a percentage of capacity.
    #[must_use]
    pub fn free_percent(&self) -> u64 {
        if self.capacity == 0 {
            return 0;
        }
        self.capacity.saturating_sub(self.used) * 100 / self.capacity
    }
}

/// Group and membership persistence.
#[async_trait]
pub trait GroupStore: Backend {
    /// Inserts a new group.
    async fn insert_group(&self, group: Group) -> Result<(), Self::Error>;

    /// Fetches one group.
    async fn get_group(&self, id: &str) -> Result<Option<Group>, Self::Error>;

    /// All groups.
    async fn groups(&self) -> Result<Vec<Group>, Self::Error>;

    /// Adds `delta` bytes to the group size, saturating at zero.
    async fn adjust_group_size(&self, id: &str, delta: i64) -> Result<(), Self::Error>;

    /// Recomputes the group size from its NORMAL files and returns it.
    async fn recalculate_group_size(&self, id: &str) -> Result<u64, Self::Error>;

    /// Overwrites the first-finish watermark.
    async fn set_first_finish_ver(&self, id: &str, ver: u64) -> Result<(), Self::Error>;

    /// Overwrites the latest deletion version.
    async fn set_deleted_ver(&self, id: &str, ver: u64) -> Result<(), Self::Error>;

    /// Space usage of non-full groups, keyed by size class.
    async fn class_usage(&self, node_capacity: u64)
    -> Result<HashMap<usize, ClassUsage>, Self::Error>;

    /// Adds a member to a group.
    async fn add_member(&self, group: &str, member: GroupNode) -> Result<(), Self::Error>;

    /// Replaces a membership record.
    async fn put_member(&self, group: &str, member: GroupNode) -> Result<(), Self::Error>;

    /// Removes a member from a group.
    async fn remove_member(&self, group: &str, node: &str) -> Result<(), Self::Error>;

    /// Fetches one membership record.
    async fn member(&self, group: &str, node: &str) -> Result<Option<GroupNode>, Self::Error>;

    /// All members of a group.
    async fn members(&self, group: &str) -> Result<Vec<GroupNode>, Self::Error>;

    /// Number of ONLINE members of a group.
    async fn online_member_count(&self, group: &str) -> Result<usize, Self::Error>;

    /// Number of ONLINE members per group; groups without any are absent.
    async fn online_member_counts(&self) -> Result<HashMap<String, usize>, Self::Error>;

    /// Number of members that reported at least `ver`, optionally restricted
    /// to one state.
    async fn members_at_version(
        &self,
        group: &str,
        ver: u64,
        state: Option<MemberState>,
    ) -> Result<usize, Self::Error>;

    /// Peers of ONLINE members that reported at least `ver`.
    async fn holders(&self, group: &str, ver: u64) -> Result<Vec<Peer>, Self::Error>;

    /// Ids of members that reported less than `ver`.
    async fn lacking_members(&self, group: &str, ver: u64) -> Result<Vec<String>, Self::Error>;

    /// Groups a node belongs to.
    async fn node_groups(&self, node: &str) -> Result<Vec<Group>, Self::Error>;

    /// Membership records of a node, keyed by group id.
    async fn node_memberships(&self, node: &str)
    -> Result<HashMap<String, GroupNode>, Self::Error>;
}
