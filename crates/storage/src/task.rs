use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Backend, TaskCheckpoint};

/// Lifecycle of an expansion task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpandState {
    /// Issued, not yet handed to its node.
    Init,

    /// Handed to its node in a heartbeat response.
    Notified,

    /// The node fetched the task and is transferring.
    Started,

    /// Completed.
    Finished,

    /// Reported as failed or failed by the reaper.
    Failed,
}

impl ExpandState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Transition table. Re-issuing a task through an upsert is not a
    /// transition and is not checked here.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Init => !matches!(next, Self::Init),
            Self::Notified => matches!(next, Self::Started | Self::Finished | Self::Failed),
            Self::Started => matches!(next, Self::Finished | Self::Failed),
            Self::Finished | Self::Failed => false,
        }
    }
}

/// A propagation task: `node` spreads `md5` to the members of `group` that
/// lack it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandNode {
    /// Assigned by the store on first insert.
    pub id: u64,

    /// Group to propagate within.
    pub group: String,

    /// Node carrying out the task.
    pub node: String,

    /// File to propagate.
    pub md5: String,

    /// Current state.
    pub state: ExpandState,

    /// Issue time (unix seconds).
    pub created_tm: i64,

    /// Absolute deadline (unix seconds).
    pub timeout: i64,

    /// Number of failed attempts.
    pub failed_times: u32,

    /// File size in bytes.
    pub size: u64,

    /// Priority level, 0 before first completion.
    pub level: u8,

    /// File version when the task was handed out.
    pub ver: u64,
}

impl ExpandNode {
    /// Whether the task can no longer be acted upon at `now`.
    #[must_use]
    pub const fn is_finished(&self, now: i64) -> bool {
        self.state.is_terminal() || self.timeout <= now
    }
}

/// Lifecycle of an unsafe task; completion is binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnsafeExpandState {
    /// Waiting for the node.
    Init,

    /// The node holds the file.
    Finished,
}

/// A best-effort propagation task used while a group is below `min_pieces`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsafeExpandNode {
    /// Assigned by the store on first insert.
    pub id: u64,

    /// Group the file belongs to.
    pub group: String,

    /// Node asked to keep a copy.
    pub node: String,

    /// File to copy.
    pub md5: String,

    /// Current state.
    pub state: UnsafeExpandState,

    /// Issue time (unix seconds).
    pub created_tm: i64,
}

/// Expansion task persistence.
#[async_trait]
pub trait TaskStore: Backend {
    /// Fetches the task for (group, node, md5).
    async fn expand_node(
        &self,
        group: &str,
        node: &str,
        md5: &str,
    ) -> Result<Option<ExpandNode>, Self::Error>;

    /// Fetches a task by id.
    async fn expand_node_by_id(&self, id: u64) -> Result<Option<ExpandNode>, Self::Error>;

    /// Inserts a task, or replaces the one for the same (group, node, md5)
    /// keeping its id and failure counter. Returns the task id.
    async fn upsert_expand_node(&self, task: ExpandNode) -> Result<u64, Self::Error>;

    /// Non-terminal tasks of (group, md5) whose deadline is after `now`.
    async fn open_expand_nodes(
        &self,
        group: &str,
        md5: &str,
        now: i64,
    ) -> Result<Vec<ExpandNode>, Self::Error>;

    /// Tasks of a node in the given state, oldest first.
    async fn node_expand_nodes(
        &self,
        node: &str,
        state: ExpandState,
        limit: usize,
    ) -> Result<Vec<ExpandNode>, Self::Error>;

    /// Moves a task to `state` with a new deadline, optionally counting a
    /// failure.
    async fn set_expand_state(
        &self,
        id: u64,
        state: ExpandState,
        timeout: i64,
        count_failure: bool,
    ) -> Result<(), Self::Error>;

    /// Extends the deadline of a task.
    async fn set_expand_timeout(&self, id: u64, timeout: i64) -> Result<(), Self::Error>;

    /// Fails every non-terminal task of a node. Returns how many changed.
    async fn fail_node_expand_nodes(&self, node: &str, now: i64) -> Result<usize, Self::Error>;

    /// Removes a task.
    async fn delete_expand_node(&self, id: u64) -> Result<(), Self::Error>;

    /// Removes the tasks of (group, md5), except `keep` if given.
    async fn delete_expand_nodes(
        &self,
        group: &str,
        md5: &str,
        keep: Option<u64>,
    ) -> Result<usize, Self::Error>;

    /// Removes tasks issued before `before`. Returns how many were removed.
    async fn delete_expand_nodes_created_before(&self, before: i64) -> Result<usize, Self::Error>;

    /// Tasks ordered by `(timeout, id)` that come after `checkpoint` and whose
    /// deadline is not later than `until`.
    async fn timed_out_expand_nodes(
        &self,
        checkpoint: TaskCheckpoint,
        until: i64,
        limit: usize,
    ) -> Result<Vec<ExpandNode>, Self::Error>;

    /// Fetches an unsafe task by id.
    async fn unsafe_expand_node(&self, id: u64) -> Result<Option<UnsafeExpandNode>, Self::Error>;

    /// All unsafe tasks.
    async fn unsafe_expand_nodes(&self) -> Result<Vec<UnsafeExpandNode>, Self::Error>;

    /// Inserts or replaces the unsafe task for (group, node, md5). Returns
    /// its id.
    async fn upsert_unsafe_expand_node(&self, task: UnsafeExpandNode) -> Result<u64, Self::Error>;

    /// Unsafe tasks of a node in the given state.
    async fn node_unsafe_expand_nodes(
        &self,
        node: &str,
        state: UnsafeExpandState,
        limit: usize,
    ) -> Result<Vec<UnsafeExpandNode>, Self::Error>;

    /// Overwrites the state of an unsafe task.
    async fn set_unsafe_state(&self, id: u64, state: UnsafeExpandState)
    -> Result<(), Self::Error>;

    /// Removes the unsafe task for (group, node, md5).
    async fn delete_unsafe_expand_node(
        &self,
        group: &str,
        node: &str,
        md5: &str,
    ) -> Result<(), Self::Error>;

    /// Registers a file as being distributed unsafely within a group.
    async fn add_unsafe_file(&self, group: &str, md5: &str) -> Result<(), Self::Error>;

    /// Unregisters an unsafe file and drops its tasks.
    async fn delete_unsafe_file(&self, group: &str, md5: &str) -> Result<(), Self::Error>;

    /// Nodes that finished an unsafe task for (group, md5), excluding
    /// `exclude`.
    async fn unsafe_holders(
        &self,
        group: &str,
        md5: &str,
        exclude: &[String],
        limit: usize,
    ) -> Result<Vec<String>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ExpandState::{Failed, Finished, Init, Notified, Started};

        assert!(Init.can_transition_to(Notified));
        assert!(Notified.can_transition_to(Started));
        assert!(Started.can_transition_to(Finished));
        assert!(Started.can_transition_to(Failed));
        assert!(Notified.can_transition_to(Failed));

        assert!(!Started.can_transition_to(Notified));
        assert!(!Notified.can_transition_to(Init));
        for next in [Init, Notified, Started, Finished, Failed] {
            assert!(!Finished.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_expired_task_is_finished() {
        let task = ExpandNode {
            id: 1,
            group: "g".to_string(),
            node: "n".to_string(),
            md5: "m".to_string(),
            state: ExpandState::Started,
            created_tm: 0,
            timeout: 100,
            failed_times: 0,
            size: 1,
            level: 0,
            ver: 1,
        };

        assert!(!task.is_finished(99));
        assert!(task.is_finished(100));
    }
}
