//! In-memory (single process) data source for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod checker;
mod error;
mod file;
mod group;
mod node;
mod task;

pub use error::Error;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use meshvault_storage::{
    Backend, ExpandNode, Group, GroupFile, GroupNode, InvalidFileReport, NodeCheckpoint,
    NodeDetail, TaskCheckpoint, UnsafeExpandNode,
};
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, NodeDetail>,
    online_reports: HashMap<String, Vec<i64>>,
    groups: BTreeMap<String, Group>,
    // group id -> node id -> membership
    members: BTreeMap<String, BTreeMap<String, GroupNode>>,
    counters: HashMap<String, u64>,
    // (group id, md5) -> record
    files: BTreeMap<(String, String), GroupFile>,
    // md5 -> nodes holding the original
    sources: HashMap<String, BTreeSet<String>>,
    checksums: HashMap<String, String>,
    invalid_reports: Vec<InvalidFileReport>,
    tasks: BTreeMap<u64, ExpandNode>,
    last_task_id: u64,
    unsafe_tasks: BTreeMap<u64, UnsafeExpandNode>,
    last_unsafe_id: u64,
    unsafe_files: BTreeSet<(String, String)>,
    claims: HashMap<String, Instant>,
    node_checkpoint: NodeCheckpoint,
    task_checkpoint: TaskCheckpoint,
    config: HashMap<String, String>,
}

impl State {
    fn group_mut(&mut self, id: &str) -> Result<&mut Group, Error> {
        self.groups
            .get_mut(id)
            .ok_or_else(|| Error::UnknownGroup(id.to_string()))
    }

    fn group_size(&self, id: &str) -> u64 {
        self.files
            .values()
            .filter(|file| file.group == id && file.is_normal())
            .map(|file| file.size)
            .sum()
    }
}

/// In-memory data source.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    /// Creates a new, empty instance of `MemoryStorage`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `node` holds the original of `md5`.
    pub async fn add_source(&self, node: impl Into<String>, md5: impl Into<String>) {
        self.state
            .lock()
            .await
            .sources
            .entry(md5.into())
            .or_default()
            .insert(node.into());
    }

    /// Stores a raw configuration value.
    pub async fn set_config(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state
            .lock()
            .await
            .config
            .insert(key.into(), value.into());
    }

    /// Invalid-file reports received so far.
    pub async fn invalid_reports(&self) -> Vec<InvalidFileReport> {
        self.state.lock().await.invalid_reports.clone()
    }

    /// Whether a file is registered for unsafe distribution.
    pub async fn is_unsafe_file(&self, group: &str, md5: &str) -> bool {
        self.state
            .lock()
            .await
            .unsafe_files
            .contains(&(group.to_string(), md5.to_string()))
    }
}

impl Backend for MemoryStorage {
    type Error = Error;
}
