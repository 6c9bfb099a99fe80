use std::collections::BTreeSet;

use meshvault_locks::LockManager;
use meshvault_storage::{DataSource, ExpandState, TaskCheckpoint};
use tracing::{debug, info};

use super::Pass;
use crate::coordinator::{Coordinator, secs, unix_now};
use crate::cooldown::CooldownKey;
use crate::error::{Error, Result};
use crate::jobs::BackgroundJob;

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Walks tasks whose deadline passed, in `(timeout, id)` order from the
    /// stored checkpoint. Finished tasks are removed; anything else makes the
    /// file's lagging members fetch it again.
    pub(crate) async fn reap_timed_out_tasks(&self) -> Result<Pass> {
        if !self.cooldown(CooldownKey::TaskTimeouts).await? {
            return Ok(Pass::Skipped);
        }

        let batch = self.config().checkers.task_batch.max(1);
        let until = unix_now() - secs(self.config().tasks.timeout_grace);
        let mut checkpoint = self
            .store()
            .task_checkpoint()
            .await
            .map_err(Error::persistence)?;
        let mut processed = 0;

        loop {
            let tasks = self
                .store()
                .timed_out_expand_nodes(checkpoint, until, batch)
                .await
                .map_err(Error::persistence)?;
            let Some(last) = tasks.last() else {
                break;
            };
            let next = TaskCheckpoint {
                timeout: last.timeout,
                id: last.id,
            };

            for task in &tasks {
                if task.state == ExpandState::Finished {
                    self.store()
                        .delete_expand_node(task.id)
                        .await
                        .map_err(Error::persistence)?;
                } else {
                    self.schedule(BackgroundJob::BumpFileVersion {
                        group: task.group.clone(),
                        md5: task.md5.clone(),
                    });
                }
            }

            checkpoint = next;
            self.store()
                .set_task_checkpoint(checkpoint)
                .await
                .map_err(Error::persistence)?;
            processed += tasks.len();

            if tasks.len() < batch {
                break;
            }
        }

        if processed > 0 {
            debug!("reaped {} timed out tasks", processed);
        }

        Ok(Pass::Completed { processed })
    }

    /// Drops NEW_ADD records whose source push never converged, together with
    /// their tasks, and recounts the sizes of the touched groups.
    pub(crate) async fn clean_stale_new_files(&self) -> Result<Pass> {
        if !self.cooldown(CooldownKey::StaleNewFiles).await? {
            return Ok(Pass::Skipped);
        }

        let before = unix_now() - secs(self.config().groups.stale_new_file_age);
        let files = self
            .store()
            .stale_new_files(before, self.config().checkers.stale_new_file_batch)
            .await
            .map_err(Error::persistence)?;

        let mut touched = BTreeSet::new();
        for file in &files {
            self.store()
                .delete_group_file(&file.group, &file.md5)
                .await
                .map_err(Error::persistence)?;
            self.store()
                .delete_expand_nodes(&file.group, &file.md5, None)
                .await
                .map_err(Error::persistence)?;
            touched.insert(file.group.as_str());
        }

        for group in touched {
            let size = self
                .store()
                .recalculate_group_size(group)
                .await
                .map_err(Error::persistence)?;
            debug!("group {} resized to {} after cleanup", group, size);
        }

        if !files.is_empty() {
            info!("dropped {} stale new files", files.len());
        }

        Ok(Pass::Completed {
            processed: files.len(),
        })
    }
}
