use async_trait::async_trait;
use meshvault_storage::{
    ExpandNode, ExpandState, TaskCheckpoint, TaskStore, UnsafeExpandNode, UnsafeExpandState,
};

use crate::{Error, MemoryStorage};

#[async_trait]
impl TaskStore for MemoryStorage {
    async fn expand_node(
        &self,
        group: &str,
        node: &str,
        md5: &str,
    ) -> Result<Option<ExpandNode>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .tasks
            .values()
            .find(|task| task.group == group && task.node == node && task.md5 == md5)
            .cloned())
    }

    async fn expand_node_by_id(&self, id: u64) -> Result<Option<ExpandNode>, Self::Error> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn upsert_expand_node(&self, mut task: ExpandNode) -> Result<u64, Self::Error> {
        let mut state = self.state.lock().await;
        let existing = state
            .tasks
            .values()
            .find(|old| old.group == task.group && old.node == task.node && old.md5 == task.md5)
            .map(|old| (old.id, old.failed_times));

        if let Some((id, failed_times)) = existing {
            task.id = id;
            task.failed_times = failed_times;
        } else {
            state.last_task_id += 1;
            task.id = state.last_task_id;
        }
        let id = task.id;
        state.tasks.insert(id, task);

        Ok(id)
    }

    async fn open_expand_nodes(
        &self,
        group: &str,
        md5: &str,
        now: i64,
    ) -> Result<Vec<ExpandNode>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .tasks
            .values()
            .filter(|task| task.group == group && task.md5 == md5 && !task.is_finished(now))
            .cloned()
            .collect())
    }

    async fn node_expand_nodes(
        &self,
        node: &str,
        task_state: ExpandState,
        limit: usize,
    ) -> Result<Vec<ExpandNode>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .tasks
            .values()
            .filter(|task| task.node == node && task.state == task_state)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_expand_state(
        &self,
        id: u64,
        task_state: ExpandState,
        timeout: i64,
        count_failure: bool,
    ) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(&id).ok_or(Error::UnknownTask(id))?;
        task.state = task_state;
        task.timeout = timeout;
        if count_failure {
            task.failed_times += 1;
        }

        Ok(())
    }

    async fn set_expand_timeout(&self, id: u64, timeout: i64) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state
            .tasks
            .get_mut(&id)
            .ok_or(Error::UnknownTask(id))?
            .timeout = timeout;

        Ok(())
    }

    async fn fail_node_expand_nodes(&self, node: &str, now: i64) -> Result<usize, Self::Error> {
        let mut state = self.state.lock().await;
        let mut changed = 0;

        for task in state.tasks.values_mut() {
            if task.node == node && !task.state.is_terminal() {
                task.state = ExpandState::Failed;
                task.timeout = now;
                changed += 1;
            }
        }

        Ok(changed)
    }

    async fn delete_expand_node(&self, id: u64) -> Result<(), Self::Error> {
        self.state.lock().await.tasks.remove(&id);

        Ok(())
    }

    async fn delete_expand_nodes(
        &self,
        group: &str,
        md5: &str,
        keep: Option<u64>,
    ) -> Result<usize, Self::Error> {
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state
            .tasks
            .retain(|id, task| task.group != group || task.md5 != md5 || Some(*id) == keep);

        Ok(before - state.tasks.len())
    }

    async fn delete_expand_nodes_created_before(&self, before: i64) -> Result<usize, Self::Error> {
        let mut state = self.state.lock().await;
        let count = state.tasks.len();
        state.tasks.retain(|_, task| task.created_tm >= before);

        Ok(count - state.tasks.len())
    }

    async fn timed_out_expand_nodes(
        &self,
        checkpoint: TaskCheckpoint,
        until: i64,
        limit: usize,
    ) -> Result<Vec<ExpandNode>, Self::Error> {
        let state = self.state.lock().await;
        let mut tasks: Vec<ExpandNode> = state
            .tasks
            .values()
            .filter(|task| {
                task.timeout <= until && (task.timeout, task.id) > (checkpoint.timeout, checkpoint.id)
            })
            .cloned()
            .collect();

        tasks.sort_by_key(|task| (task.timeout, task.id));
        tasks.truncate(limit);

        Ok(tasks)
    }

    async fn unsafe_expand_node(&self, id: u64) -> Result<Option<UnsafeExpandNode>, Self::Error> {
        Ok(self.state.lock().await.unsafe_tasks.get(&id).cloned())
    }

    async fn unsafe_expand_nodes(&self) -> Result<Vec<UnsafeExpandNode>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .unsafe_tasks
            .values()
            .cloned()
            .collect())
    }

    async fn upsert_unsafe_expand_node(
        &self,
        mut task: UnsafeExpandNode,
    ) -> Result<u64, Self::Error> {
        let mut state = self.state.lock().await;
        let existing = state
            .unsafe_tasks
            .values()
            .find(|old| old.group == task.group && old.node == task.node && old.md5 == task.md5)
            .map(|old| old.id);

        task.id = if let Some(id) = existing {
            id
        } else {
            state.last_unsafe_id += 1;
            state.last_unsafe_id
        };
        let id = task.id;
        state.unsafe_tasks.insert(id, task);

        Ok(id)
    }

    async fn node_unsafe_expand_nodes(
        &self,
        node: &str,
        task_state: UnsafeExpandState,
        limit: usize,
    ) -> Result<Vec<UnsafeExpandNode>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .unsafe_tasks
            .values()
            .filter(|task| task.node == node && task.state == task_state)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_unsafe_state(
        &self,
        id: u64,
        task_state: UnsafeExpandState,
    ) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state
            .unsafe_tasks
            .get_mut(&id)
            .ok_or(Error::UnknownTask(id))?
            .state = task_state;

        Ok(())
    }

    async fn delete_unsafe_expand_node(
        &self,
        group: &str,
        node: &str,
        md5: &str,
    ) -> Result<(), Self::Error> {
        self.state
            .lock()
            .await
            .unsafe_tasks
            .retain(|_, task| task.group != group || task.node != node || task.md5 != md5);

        Ok(())
    }

    async fn add_unsafe_file(&self, group: &str, md5: &str) -> Result<(), Self::Error> {
        self.state
            .lock()
            .await
            .unsafe_files
            .insert((group.to_string(), md5.to_string()));

        Ok(())
    }

    async fn delete_unsafe_file(&self, group: &str, md5: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state
            .unsafe_files
            .remove(&(group.to_string(), md5.to_string()));
        state
            .unsafe_tasks
            .retain(|_, task| task.group != group || task.md5 != md5);

        Ok(())
    }

    async fn unsafe_holders(
        &self,
        group: &str,
        md5: &str,
        exclude: &[String],
        limit: usize,
    ) -> Result<Vec<String>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .unsafe_tasks
            .values()
            .filter(|task| {
                task.group == group
                    && task.md5 == md5
                    && task.state == UnsafeExpandState::Finished
                    && !exclude.contains(&task.node)
            })
            .take(limit)
            .map(|task| task.node.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(node: &str, timeout: i64) -> ExpandNode {
        ExpandNode {
            id: 0,
            group: "g".to_string(),
            node: node.to_string(),
            md5: "m".to_string(),
            state: ExpandState::Init,
            created_tm: 0,
            timeout,
            failed_times: 0,
            size: 1,
            level: 0,
            ver: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_identity_and_failures() {
        let storage = MemoryStorage::new();

        let id = storage.upsert_expand_node(task("n1", 10)).await.unwrap();
        storage
            .set_expand_state(id, ExpandState::Failed, 10, true)
            .await
            .unwrap();

        let again = storage.upsert_expand_node(task("n1", 20)).await.unwrap();
        assert_eq!(again, id);

        let stored = storage.expand_node_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExpandState::Init);
        assert_eq!(stored.failed_times, 1);
        assert_eq!(stored.timeout, 20);

        let other = storage.upsert_expand_node(task("n2", 20)).await.unwrap();
        assert_ne!(other, id);
    }

    #[tokio::test]
    async fn test_timeout_scan_resumes_after_checkpoint() {
        let storage = MemoryStorage::new();
        let a = storage.upsert_expand_node(task("a", 10)).await.unwrap();
        let b = storage.upsert_expand_node(task("b", 10)).await.unwrap();
        storage.upsert_expand_node(task("c", 30)).await.unwrap();

        let first = storage
            .timed_out_expand_nodes(TaskCheckpoint::default(), 20, 1)
            .await
            .unwrap();
        assert_eq!(first[0].id, a);

        let rest = storage
            .timed_out_expand_nodes(TaskCheckpoint { timeout: 10, id: a }, 20, 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, b);
    }

    #[tokio::test]
    async fn test_delete_keeps_requested_task() {
        let storage = MemoryStorage::new();
        let keep = storage.upsert_expand_node(task("a", 10)).await.unwrap();
        storage.upsert_expand_node(task("b", 10)).await.unwrap();

        let removed = storage.delete_expand_nodes("g", "m", Some(keep)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(storage.expand_node_by_id(keep).await.unwrap().is_some());
    }
}
