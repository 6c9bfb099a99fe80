use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Backend;

/// Resume point of the node timeout scan. Nodes sharing a heartbeat second
/// are ordered by id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCheckpoint {
    /// Heartbeat time of the last processed node.
    pub update_tm: i64,

    /// Id of the last processed node.
    pub id: String,
}

/// Resume point of the task timeout scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    /// Deadline of the last processed task.
    pub timeout: i64,

    /// Id of the last processed task.
    pub id: u64,
}

/// Shared bookkeeping of the background checkers.
#[async_trait]
pub trait CheckerStore: Backend {
    /// Claims `key` for `ttl` if nobody holds it. Returns whether the claim
    /// was taken. Must be atomic across coordinators.
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, Self::Error>;

    /// Resume point of the node timeout scan.
    async fn node_checkpoint(&self) -> Result<NodeCheckpoint, Self::Error>;

    /// Stores the node timeout scan checkpoint.
    async fn set_node_checkpoint(&self, checkpoint: NodeCheckpoint) -> Result<(), Self::Error>;

    /// Resume point of the task timeout scan.
    async fn task_checkpoint(&self) -> Result<TaskCheckpoint, Self::Error>;

    /// Stores the task timeout scan checkpoint.
    async fn set_task_checkpoint(&self, checkpoint: TaskCheckpoint) -> Result<(), Self::Error>;
}

/// Runtime tunables persistence.
#[async_trait]
pub trait ConfigStore: Backend {
    /// Every stored key with its raw value.
    async fn config_entries(&self) -> Result<HashMap<String, String>, Self::Error>;
}
