use meshvault_locks::LockManager;
use meshvault_storage::{DataSource, MemberState, NodeCheckpoint};
use tracing::{debug, info, warn};

use super::Pass;
use crate::coordinator::{Coordinator, secs, unix_now};
use crate::cooldown::CooldownKey;
use crate::error::{Error, Result};

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Takes the memberships of nodes that stopped heartbeating offline,
    /// refills their groups and fails their open tasks.
    ///
    /// Nodes are scanned from the stored checkpoint; the checkpoint only moves
    /// once the whole batch went through.
    pub(crate) async fn reap_timed_out_nodes(&self) -> Result<Pass> {
        if !self.cooldown(CooldownKey::NodeTimeouts).await? {
            return Ok(Pass::Skipped);
        }

        let checkpoint = self
            .store()
            .node_checkpoint()
            .await
            .map_err(Error::persistence)?;
        let until = unix_now() - secs(self.config().nodes.liveness);
        let nodes = self
            .store()
            .timed_out_nodes(&checkpoint, until, self.config().checkers.node_batch)
            .await
            .map_err(Error::persistence)?;

        if nodes.is_empty() {
            return Ok(Pass::Completed { processed: 0 });
        }

        let ceiling = self.config().groups.expansion_active_ceiling;
        for node in &nodes {
            let memberships = self
                .store()
                .node_memberships(node.id())
                .await
                .map_err(Error::persistence)?;

            for (group_id, mut member) in memberships {
                if !member.is_online() {
                    continue;
                }

                member.state = MemberState::Offline;
                self.store()
                    .put_member(&group_id, member)
                    .await
                    .map_err(Error::persistence)?;

                let group = self.require_group(&group_id).await?;
                match self.expand_to_perfect_size(&group, ceiling, None).await {
                    Ok(expansion) => debug!("group {}: {:?}", group_id, expansion),
                    Err(e @ Error::InsufficientNodes { .. }) => {
                        warn!("group {} lost {}: {}", group_id, node.id(), e);
                    }
                    Err(e) => return Err(e),
                }
            }

            self.restart_node_tasks(node.id()).await?;
        }

        // Batches come back in checkpoint order, so the last node is the
        // furthest one.
        let last = nodes
            .last()
            .map_or(checkpoint, |node| NodeCheckpoint {
                update_tm: node.update_tm,
                id: node.id().to_string(),
            });
        self.store()
            .set_node_checkpoint(last)
            .await
            .map_err(Error::persistence)?;
        info!("{} nodes timed out", nodes.len());

        Ok(Pass::Completed {
            processed: nodes.len(),
        })
    }

    /// Deletes nodes that have been inactive for longer than the retention
    /// window, then purges expired tasks.
    pub(crate) async fn delete_stale_nodes(&self) -> Result<Pass> {
        if !self.cooldown(CooldownKey::StaleNodes).await? {
            return Ok(Pass::Skipped);
        }

        let checkers = &self.config().checkers;
        let before = unix_now() - secs(self.config().nodes.retention);
        let mut processed = 0;

        loop {
            let ids = self
                .store()
                .inactive_nodes(before, checkers.stale_node_batch)
                .await
                .map_err(Error::persistence)?;

            let mut deleted = 0;
            for id in &ids {
                match self.delete_node(id).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!("failed to delete stale node {}: {}", id, e),
                }
            }
            processed += deleted;

            if ids.len() < checkers.stale_node_batch || deleted == 0 {
                break;
            }
            tokio::time::sleep(checkers.stale_node_batch_pause).await;
        }

        let purged = self
            .store()
            .delete_expand_nodes_created_before(unix_now() - secs(self.config().tasks.retention))
            .await
            .map_err(Error::persistence)?;
        if processed > 0 || purged > 0 {
            info!("deleted {} stale nodes and {} old tasks", processed, purged);
        }

        Ok(Pass::Completed { processed })
    }

    /// Counts each node's online reports over the aggregation window.
    pub(crate) async fn aggregate_online_time(&self) -> Result<Pass> {
        if !self.cooldown(CooldownKey::OnlineTime).await? {
            return Ok(Pass::Skipped);
        }

        let page = self.config().checkers.online_time_page.max(1);
        let since = unix_now() - secs(self.config().nodes.online_count_window);
        let mut after: Option<String> = None;
        let mut processed = 0;

        loop {
            let ids = self
                .store()
                .node_ids(after.as_deref(), page)
                .await
                .map_err(Error::persistence)?;
            let Some(last) = ids.last().cloned() else {
                break;
            };

            let mut counts = self
                .store()
                .online_report_counts(&ids, since)
                .await
                .map_err(Error::persistence)?;
            for id in &ids {
                counts.entry(id.clone()).or_insert(0);
            }
            self.store()
                .set_online_counts(counts)
                .await
                .map_err(Error::persistence)?;

            processed += ids.len();
            if ids.len() < page {
                break;
            }
            after = Some(last);
        }
        debug!("aggregated online time of {} nodes", processed);

        Ok(Pass::Completed { processed })
    }
}
