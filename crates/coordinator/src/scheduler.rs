//! Expansion tasks: choosing who pushes a file next and driving each task
//! through its state machine.

use meshvault_locks::LockManager;
use meshvault_storage::{
    DataSource, ExpandNode, ExpandState, FileKind, FileState, Group, GroupFile, MemberState,
    Peer, UnsafeExpandNode, UnsafeExpandState,
};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config_set::ConfigKey;
use crate::coordinator::{Coordinator, secs, unix_now};
use crate::cooldown::CooldownKey;
use crate::error::{Error, Result};
use crate::jobs::BackgroundJob;

/// What [`Coordinator::gen_piece`] decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenPieceOutcome {
    /// The file was considered within the cooldown window.
    Throttled,
    /// Too few members lack the file to justify a transfer.
    NotEnoughWork,
    /// Enough transfers of this file are already running.
    InFlight,
    /// A task was issued.
    Scheduled {
        /// Task id.
        task: u64,
        /// Node that pushes the file.
        node: String,
        /// Priority of the task.
        level: u8,
    },
    /// The file has converged and the group is not at risk enough.
    BelowPriorityFloor,
    /// The file is retrievable and no node asked for it.
    AlreadyAvailable,
    /// No node could serve the file.
    NoSource,
}

/// A started task with everything the pushing node needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpandAssignment {
    /// The task, already STARTED.
    pub task: ExpandNode,
    /// Members that do not hold the file.
    pub lacking: Vec<String>,
    /// The file record.
    pub file: GroupFile,
    /// The group.
    pub group: Group,
}

/// An unsafe task with its file and group.
#[derive(Clone, Debug, PartialEq)]
pub struct UnsafeAssignment {
    /// The task.
    pub task: UnsafeExpandNode,
    /// The file record.
    pub file: GroupFile,
    /// The group.
    pub group: Group,
}

/// Priority of a task for a file at `ver`.
///
/// 0 before first completion; afterwards 1 to 6 as the online members at
/// `ver` fall below `start` in steps of `step`.
pub(crate) fn level_for(online_at_ver: usize, start: usize, step: usize) -> u8 {
    (1..=5u8)
        .find(|level| {
            let floor = start.saturating_sub(usize::from(level - 1) * step);
            online_at_ver >= floor
        })
        .unwrap_or(6)
}

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Decides whether a file needs another transfer task in a group and
    /// issues it. `hint` names a node that asked for the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown group or file and
    /// [`Error::InvalidState`] for a deleted file.
    pub async fn gen_piece(
        &self,
        group_id: &str,
        hint: Option<&str>,
        md5: &str,
    ) -> Result<GenPieceOutcome> {
        if !self
            .cooldown(CooldownKey::GenPiece {
                group: group_id,
                md5,
            })
            .await?
        {
            return Ok(GenPieceOutcome::Throttled);
        }

        let group = self.require_group(group_id).await?;
        let file = self.require_file(group_id, md5).await?;
        if !file.is_normal() {
            return Err(Error::invalid_state(format!(
                "file {md5} in group {group_id} is deleted"
            )));
        }

        let lacking = self.lacking_nodes(&file).await?;
        let profile = group.profile;
        let floor = ((profile.perfect_pieces - profile.safe_pieces) / 10) as usize;
        if lacking.len() <= floor {
            return Ok(GenPieceOutcome::NotEnoughWork);
        }

        let now = unix_now();
        let open = self
            .store()
            .open_expand_nodes(group_id, md5, now)
            .await
            .map_err(Error::persistence)?;
        if open.len() >= self.config().tasks.max_parallel_expansions {
            return Ok(GenPieceOutcome::InFlight);
        }

        let sources = self.source_peers(md5).await?;
        if sources
            .iter()
            .any(|peer| open.iter().any(|task| task.node == peer.id))
        {
            return Ok(GenPieceOutcome::InFlight);
        }

        let level = self.task_level(&group, file.ver).await?;
        if level == 0 {
            if let Some(peer) = sources.first() {
                return self.schedule_on(&file, &peer.id, level).await;
            }
        }

        let level_floor = self.settings().get(ConfigKey::GenPieceLevel);

        if self.is_available(md5).await? {
            let Some(hint) = hint else {
                return Ok(GenPieceOutcome::AlreadyAvailable);
            };
            if i64::from(level) < level_floor {
                return Ok(GenPieceOutcome::BelowPriorityFloor);
            }

            let members = self
                .store()
                .members(group_id)
                .await
                .map_err(Error::persistence)?;
            let online: Vec<_> = members.into_iter().filter(|m| m.is_online()).collect();
            let target = {
                let mut rng = rand::thread_rng();
                online.choose(&mut rng).map(|member| member.node.clone())
            };
            let Some(target) = target else {
                return Ok(GenPieceOutcome::NoSource);
            };

            debug!("{} asked for {}, pushing from {}", hint, md5, target);
            return self.schedule_on(&file, &target, level).await;
        }

        let origins = self
            .store()
            .source_nodes(md5, 1)
            .await
            .map_err(Error::persistence)?;
        let Some(origin) = origins.first() else {
            debug!("{} in group {} has no source", md5, group_id);
            return Ok(GenPieceOutcome::NoSource);
        };
        if i64::from(level) < level_floor {
            return Ok(GenPieceOutcome::BelowPriorityFloor);
        }

        self.schedule_on(&file, origin, level).await
    }

    /// Priority of a task for version `ver` of a group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown group.
    pub async fn expand_task_level(&self, group_id: &str, ver: u64) -> Result<u8> {
        let group = self.require_group(group_id).await?;
        self.task_level(&group, ver).await
    }

    /// Starts a NOTIFIED, unexpired task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown task and
    /// [`Error::InvalidState`] if it is not waiting to start.
    pub async fn expand_task_by_id(&self, id: u64) -> Result<ExpandAssignment> {
        let task = self.require_task(id).await?;
        if task.state != ExpandState::Notified {
            return Err(Error::invalid_state(format!(
                "task {id} is {:?}, not notified",
                task.state
            )));
        }
        if task.timeout < unix_now() {
            return Err(Error::invalid_state(format!("task {id} expired")));
        }

        self.start_task(task).await
    }

    /// Starts the NOTIFIED task of `node` for a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no such task exists and
    /// [`Error::InvalidState`] if it is not waiting to start.
    pub async fn expand_task(&self, group_id: &str, node: &str, md5: &str) -> Result<ExpandAssignment> {
        let task = self
            .store()
            .expand_node(group_id, node, md5)
            .await
            .map_err(Error::persistence)?
            .ok_or_else(|| Error::not_found(format!("task {group_id}:{node}:{md5}")))?;
        if task.state != ExpandState::Notified {
            return Err(Error::invalid_state(format!(
                "task {} is {:?}, not notified",
                task.id, task.state
            )));
        }

        self.start_task(task).await
    }

    /// Records the outcome of a first-spread transfer.
    ///
    /// On success the other tasks for the file are dropped; on failure the
    /// task fails and the file version is bumped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown task and
    /// [`Error::InvalidState`] if it already ended or expired.
    pub async fn expand_finished(&self, id: u64, success: bool) -> Result<()> {
        let task = self.require_task(id).await?;
        if task.is_finished(unix_now()) {
            return Err(Error::invalid_state(format!("task {id} already ended")));
        }

        if success {
            let dropped = self
                .store()
                .delete_expand_nodes(&task.group, &task.md5, Some(id))
                .await
                .map_err(Error::persistence)?;
            debug!("task {} finished, dropped {} siblings", id, dropped);
            self.transition(&task, ExpandState::Finished).await
        } else {
            self.transition(&task, ExpandState::Failed).await
        }
    }

    /// Records the outcome of a NEW_ADD transfer.
    ///
    /// On success a NEW_ADD file is folded into the first-spread set once
    /// enough members are online at the group's first-finish version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown task,
    /// [`Error::InvalidState`] if it already ended and
    /// [`Error::LockUnavailable`] if the promotion could not lock the group.
    pub async fn p2p_expand_finished(&self, id: u64, success: bool) -> Result<()> {
        let task = self.require_task(id).await?;
        if task.state.is_terminal() {
            return Err(Error::invalid_state(format!("task {id} already ended")));
        }

        if success {
            self.promote_new_file(&task.group, &task.md5).await?;
        }

        self.store()
            .delete_expand_nodes(&task.group, &task.md5, Some(id))
            .await
            .map_err(Error::persistence)?;

        let next = if success {
            ExpandState::Finished
        } else {
            ExpandState::Failed
        };
        self.set_task_state(&task, next, false).await
    }

    /// Drops every open task of a node, e.g. after it restarted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn restart_node_tasks(&self, node: &str) -> Result<usize> {
        let failed = self
            .store()
            .fail_node_expand_nodes(node, unix_now())
            .await
            .map_err(Error::persistence)?;
        if failed > 0 {
            info!("failed {} open tasks of {}", failed, node);
        }

        Ok(failed)
    }

    /// Registers an unsafe file and one unsafe task per online member when
    /// the group is below its minimum. Returns the number of tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown group.
    pub async fn schedule_unsafe_distribution(&self, group_id: &str, md5: &str) -> Result<usize> {
        let group = self.require_group(group_id).await?;
        let members = self
            .store()
            .members(group_id)
            .await
            .map_err(Error::persistence)?;
        let online: Vec<_> = members.into_iter().filter(|m| m.is_online()).collect();

        if online.len() >= group.profile.min_pieces as usize {
            return Ok(0);
        }

        self.store()
            .add_unsafe_file(group_id, md5)
            .await
            .map_err(Error::persistence)?;

        let now = unix_now();
        for member in &online {
            self.store()
                .upsert_unsafe_expand_node(UnsafeExpandNode {
                    id: 0,
                    group: group_id.to_string(),
                    node: member.node.clone(),
                    md5: md5.to_string(),
                    state: UnsafeExpandState::Init,
                    created_tm: now,
                })
                .await
                .map_err(Error::persistence)?;
        }
        warn!(
            "group {} has {} online members, {} distributed unsafely",
            group_id,
            online.len(),
            md5
        );

        Ok(online.len())
    }

    /// Unsafe tasks of a node in a state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn unsafe_expand_tasks(
        &self,
        node: &str,
        state: UnsafeExpandState,
        limit: usize,
    ) -> Result<Vec<UnsafeExpandNode>> {
        self.store()
            .node_unsafe_expand_nodes(node, state, limit)
            .await
            .map_err(Error::persistence)
    }

    /// Every unsafe task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn all_unsafe_expand_tasks(&self) -> Result<Vec<UnsafeExpandNode>> {
        self.store()
            .unsafe_expand_nodes()
            .await
            .map_err(Error::persistence)
    }

    /// An INIT unsafe task with its file and group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the task, group or file is missing and
    /// [`Error::InvalidState`] if the task is not INIT.
    pub async fn unsafe_expand_task_by_id(&self, id: u64) -> Result<UnsafeAssignment> {
        let task = self.require_unsafe_task(id).await?;
        if task.state != UnsafeExpandState::Init {
            return Err(Error::invalid_state(format!("unsafe task {id} is not init")));
        }

        let group = self.require_group(&task.group).await?;
        let file = self.require_file(&task.group, &task.md5).await?;

        Ok(UnsafeAssignment { task, file, group })
    }

    /// Marks an unsafe task done, or back to INIT on failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown task.
    pub async fn unsafe_expand_finished(&self, id: u64, success: bool) -> Result<()> {
        self.require_unsafe_task(id).await?;

        let state = if success {
            UnsafeExpandState::Finished
        } else {
            UnsafeExpandState::Init
        };
        self.store()
            .set_unsafe_state(id, state)
            .await
            .map_err(Error::persistence)
    }

    /// Drops the unsafe task of a node for a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn delete_unsafe_expand_task(&self, group_id: &str, node: &str, md5: &str) -> Result<()> {
        self.store()
            .delete_unsafe_expand_node(group_id, node, md5)
            .await
            .map_err(Error::persistence)
    }

    /// Drops an unsafe file registration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn delete_unsafe_file(&self, group_id: &str, md5: &str) -> Result<()> {
        self.store()
            .delete_unsafe_file(group_id, md5)
            .await
            .map_err(Error::persistence)
    }

    /// Moves INIT tasks of a node to NOTIFIED and returns them.
    pub(crate) async fn hand_out_tasks(&self, node: &str) -> Result<Vec<ExpandNode>> {
        let pending = self
            .store()
            .node_expand_nodes(node, ExpandState::Init, self.config().tasks.tasks_per_heartbeat)
            .await
            .map_err(Error::persistence)?;

        let mut handed = Vec::with_capacity(pending.len());
        for task in pending {
            let file = match self.require_file(&task.group, &task.md5).await {
                Ok(file) => file,
                Err(e) => {
                    warn!("skipping task {}: {}", task.id, e);
                    continue;
                }
            };

            let notified = ExpandNode {
                state: ExpandState::Notified,
                timeout: self.lease_end(ExpandState::Notified),
                ver: file.ver,
                ..task
            };
            if let Err(e) = self
                .store()
                .upsert_expand_node(notified.clone())
                .await
                .map_err(Error::persistence)
            {
                warn!("failed to notify task {}: {}", notified.id, e);
                continue;
            }
            handed.push(notified);
        }

        Ok(handed)
    }

    /// Extends the leases of the open tasks a node reported.
    pub(crate) async fn renew_task_leases(&self, node: &str, ids: &[u64]) -> Result<usize> {
        let timeout = self.lease_end(ExpandState::Started);
        let mut renewed = 0;

        for id in ids {
            let Some(task) = self
                .store()
                .expand_node_by_id(*id)
                .await
                .map_err(Error::persistence)?
            else {
                continue;
            };
            if task.node != node || task.state.is_terminal() {
                continue;
            }

            self.store()
                .set_expand_timeout(task.id, timeout)
                .await
                .map_err(Error::persistence)?;
            renewed += 1;
        }

        Ok(renewed)
    }

    /// Issues a task, or re-issues it as a retry. A retry bumps the file
    /// version first since the earlier attempt looks stuck.
    pub(crate) async fn issue_task(&self, file: &GroupFile, node: &str, level: u8) -> Result<u64> {
        let existing = self
            .store()
            .expand_node(&file.group, node, &file.md5)
            .await
            .map_err(Error::persistence)?;
        let mut ver = file.ver;
        if let Some(existing) = existing {
            debug!("re-issuing task {} for {}", existing.id, file.md5);
            if let Some(bumped) = self.incr_group_file_ver(&file.group, &file.md5).await? {
                ver = bumped;
            }
        }

        let now = unix_now();
        self.store()
            .upsert_expand_node(ExpandNode {
                id: 0,
                group: file.group.clone(),
                node: node.to_string(),
                md5: file.md5.clone(),
                state: ExpandState::Init,
                created_tm: now,
                timeout: self.lease_end(ExpandState::Init),
                failed_times: 0,
                size: file.size,
                level,
                ver,
            })
            .await
            .map_err(Error::persistence)
    }

    /// Validated state change. A failure also bumps the file version; if the
    /// group is locked the bump is queued instead.
    pub(crate) async fn transition(&self, task: &ExpandNode, next: ExpandState) -> Result<()> {
        self.set_task_state(task, next, true).await
    }

    pub(crate) async fn task_level(&self, group: &Group, ver: u64) -> Result<u8> {
        if ver > group.first_finish_ver {
            return Ok(0);
        }

        let online = self
            .store()
            .members_at_version(&group.id, ver, Some(MemberState::Online))
            .await
            .map_err(Error::persistence)?;
        let groups = &self.config().groups;

        Ok(level_for(online, groups.level_start, groups.level_step))
    }

    /// Members that still need the file.
    pub(crate) async fn lacking_nodes(&self, file: &GroupFile) -> Result<Vec<String>> {
        match file.kind {
            FileKind::FirstSpread => self
                .store()
                .lacking_members(&file.group, file.ver)
                .await
                .map_err(Error::persistence),
            FileKind::NewAdd => Ok(self
                .store()
                .members(&file.group)
                .await
                .map_err(Error::persistence)?
                .into_iter()
                .map(|member| member.node)
                .collect()),
        }
    }

    fn lease_end(&self, state: ExpandState) -> i64 {
        let tasks = &self.config().tasks;
        let lease = match state {
            ExpandState::Init => tasks.init_lease,
            ExpandState::Notified => tasks.notified_lease,
            ExpandState::Started => tasks.started_lease,
            ExpandState::Finished | ExpandState::Failed => return unix_now(),
        };

        unix_now() + secs(lease)
    }

    async fn set_task_state(&self, task: &ExpandNode, next: ExpandState, bump: bool) -> Result<()> {
        if !task.state.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "task {} cannot move from {:?} to {:?}",
                task.id, task.state, next
            )));
        }

        let failed = next == ExpandState::Failed;
        self.store()
            .set_expand_state(task.id, next, self.lease_end(next), failed)
            .await
            .map_err(Error::persistence)?;

        if failed && bump {
            match self.incr_group_file_ver(&task.group, &task.md5).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!("task {} failed, bump of {} deferred: {}", task.id, task.md5, e);
                    self.schedule(BackgroundJob::BumpFileVersion {
                        group: task.group.clone(),
                        md5: task.md5.clone(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn start_task(&self, task: ExpandNode) -> Result<ExpandAssignment> {
        let file = self.require_file(&task.group, &task.md5).await?;
        let group = self.require_group(&task.group).await?;
        let lacking = self.lacking_nodes(&file).await?;

        self.transition(&task, ExpandState::Started).await?;

        Ok(ExpandAssignment {
            task: ExpandNode {
                state: ExpandState::Started,
                timeout: self.lease_end(ExpandState::Started),
                ..task
            },
            lacking,
            file,
            group,
        })
    }

    async fn schedule_on(&self, file: &GroupFile, node: &str, level: u8) -> Result<GenPieceOutcome> {
        let task = self.issue_task(file, node, level).await?;
        info!(
            "task {} pushes {} from {} in group {} at level {}",
            task, file.md5, node, file.group, level
        );

        Ok(GenPieceOutcome::Scheduled {
            task,
            node: node.to_string(),
            level,
        })
    }

    /// Online nodes that can serve a file: its recorded sources first, then
    /// any node holding the original.
    async fn source_peers(&self, md5: &str) -> Result<Vec<Peer>> {
        let updated_after = unix_now() - secs(self.config().nodes.liveness);

        let recorded: Vec<String> = self
            .store()
            .files_by_md5(md5, Some(FileState::Normal))
            .await
            .map_err(Error::persistence)?
            .into_iter()
            .filter_map(|file| file.src_node)
            .collect();

        if !recorded.is_empty() {
            let peers = self
                .store()
                .online_peers(&recorded, updated_after)
                .await
                .map_err(Error::persistence)?;
            if !peers.is_empty() {
                return Ok(peers);
            }
        }

        let holders = self
            .store()
            .source_nodes(md5, self.config().tasks.max_parallel_expansions)
            .await
            .map_err(Error::persistence)?;

        self.store()
            .online_peers(&holders, updated_after)
            .await
            .map_err(Error::persistence)
    }

    /// Folds a NEW_ADD file into the first-spread set once enough members
    /// are online at the first-finish version.
    async fn promote_new_file(&self, group_id: &str, md5: &str) -> Result<()> {
        let group = self.require_group(group_id).await?;
        let profile = group.profile;
        let required = (profile.safe_pieces
            + profile.safe_pieces / self.config().groups.first_finish_divisor)
            as usize;

        let online = self
            .store()
            .members_at_version(group_id, group.first_finish_ver, Some(MemberState::Online))
            .await
            .map_err(Error::persistence)?;
        let file = self.require_file(group_id, md5).await?;

        if online < required || !file.is_new_add() {
            return Ok(());
        }

        let ver = self
            .with_lock(group_id.to_string(), async {
                let current = self.require_file(group_id, md5).await?;
                let ver = self.next_version(group_id).await?;
                self.store()
                    .put_group_file(GroupFile {
                        ver,
                        kind: FileKind::FirstSpread,
                        ..current
                    })
                    .await
                    .map_err(Error::persistence)?;
                Ok(ver)
            })
            .await?;
        info!("{} promoted to first spread in {} at version {}", md5, group_id, ver);

        Ok(())
    }

    async fn require_task(&self, id: u64) -> Result<ExpandNode> {
        self.store()
            .expand_node_by_id(id)
            .await
            .map_err(Error::persistence)?
            .ok_or_else(|| Error::not_found(format!("task {id}")))
    }

    async fn require_unsafe_task(&self, id: u64) -> Result<UnsafeExpandNode> {
        self.store()
            .unsafe_expand_node(id)
            .await
            .map_err(Error::persistence)?
            .ok_or_else(|| Error::not_found(format!("unsafe task {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds() {
        assert_eq!(level_for(200, 160, 8), 1);
        assert_eq!(level_for(160, 160, 8), 1);
        assert_eq!(level_for(159, 160, 8), 2);
        assert_eq!(level_for(152, 160, 8), 2);
        assert_eq!(level_for(144, 160, 8), 3);
        assert_eq!(level_for(136, 160, 8), 4);
        assert_eq!(level_for(128, 160, 8), 5);
        assert_eq!(level_for(127, 160, 8), 6);
        assert_eq!(level_for(0, 160, 8), 6);
    }
}
