use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use meshvault_storage::{CheckerStore, ConfigStore, NodeCheckpoint, TaskCheckpoint};
use tokio::time::Instant;

use crate::MemoryStorage;

#[async_trait]
impl CheckerStore for MemoryStorage {
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, Self::Error> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        match state.claims.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                state.claims.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn node_checkpoint(&self) -> Result<NodeCheckpoint, Self::Error> {
        Ok(self.state.lock().await.node_checkpoint.clone())
    }

    async fn set_node_checkpoint(&self, checkpoint: NodeCheckpoint) -> Result<(), Self::Error> {
        self.state.lock().await.node_checkpoint = checkpoint;

        Ok(())
    }

    async fn task_checkpoint(&self) -> Result<TaskCheckpoint, Self::Error> {
        Ok(self.state.lock().await.task_checkpoint)
    }

    async fn set_task_checkpoint(&self, checkpoint: TaskCheckpoint) -> Result<(), Self::Error> {
        self.state.lock().await.task_checkpoint = checkpoint;

        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStorage {
    async fn config_entries(&self) -> Result<HashMap<String, String>, Self::Error> {
        Ok(self.state.lock().await.config.clone())
    }
}
