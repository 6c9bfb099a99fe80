use async_trait::async_trait;
use meshvault_storage::{FileKind, FileState, FileStore, GroupFile, InvalidFileReport};

use crate::MemoryStorage;

#[async_trait]
impl FileStore for MemoryStorage {
    async fn next_version(&self, key: &str) -> Result<u64, Self::Error> {
        let mut state = self.state.lock().await;
        let counter = state.counters.entry(key.to_string()).or_default();
        *counter += 1;

        Ok(*counter)
    }

    async fn current_version(&self, key: &str) -> Result<u64, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .counters
            .get(key)
            .copied()
            .unwrap_or_default())
    }

    async fn group_file(&self, group: &str, md5: &str) -> Result<Option<GroupFile>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .files
            .get(&(group.to_string(), md5.to_string()))
            .cloned())
    }

    async fn files_by_md5(
        &self,
        md5: &str,
        file_state: Option<FileState>,
    ) -> Result<Vec<GroupFile>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .files
            .values()
            .filter(|file| file.md5 == md5)
            .filter(|file| file_state.is_none_or(|state| file.state == state))
            .cloned()
            .collect())
    }

    async fn put_group_file(&self, file: GroupFile) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.group_mut(&file.group)?;
        state
            .files
            .insert((file.group.clone(), file.md5.clone()), file);

        Ok(())
    }

    async fn delete_group_file(&self, group: &str, md5: &str) -> Result<(), Self::Error> {
        self.state
            .lock()
            .await
            .files
            .remove(&(group.to_string(), md5.to_string()));

        Ok(())
    }

    async fn updated_files(
        &self,
        group: &str,
        after: u64,
        limit: usize,
        kind: FileKind,
    ) -> Result<Vec<GroupFile>, Self::Error> {
        let order = |file: &GroupFile| match kind {
            FileKind::FirstSpread => file.ver,
            FileKind::NewAdd => file.add_ver,
        };
        let state = self.state.lock().await;
        let mut files: Vec<GroupFile> = state
            .files
            .values()
            .filter(|file| file.group == group && file.kind == kind && order(file) > after)
            .cloned()
            .collect();

        files.sort_by_key(order);
        files.truncate(limit);

        Ok(files)
    }

    async fn stale_new_files(
        &self,
        before: i64,
        limit: usize,
    ) -> Result<Vec<GroupFile>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .files
            .values()
            .filter(|file| file.is_normal() && file.is_new_add() && file.last_add_tm < before)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn source_nodes(&self, md5: &str, limit: usize) -> Result<Vec<String>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .sources
            .get(md5)
            .map(|nodes| nodes.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn has_source(&self, node: &str, md5: &str) -> Result<bool, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .sources
            .get(md5)
            .is_some_and(|nodes| nodes.contains(node)))
    }

    async fn checksum(&self, md5: &str) -> Result<Option<String>, Self::Error> {
        Ok(self.state.lock().await.checksums.get(md5).cloned())
    }

    async fn set_checksum(&self, md5: &str, checksum: &str) -> Result<(), Self::Error> {
        self.state
            .lock()
            .await
            .checksums
            .insert(md5.to_string(), checksum.to_string());

        Ok(())
    }

    async fn record_invalid_file(&self, report: InvalidFileReport) -> Result<(), Self::Error> {
        self.state.lock().await.invalid_reports.push(report);

        Ok(())
    }
}
