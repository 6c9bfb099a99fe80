//! Client-facing file operations: adding, locating and retiring files.

use std::collections::HashMap;

use meshvault_locks::LockManager;
use meshvault_storage::{
    DataSource, ExpandNode, ExpandState, FileKind, FileState, Group, GroupFile,
    InvalidFileReport, MemberState, NodeFilter, Peer,
};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, StickyGroup, secs, unix_now};
use crate::error::{Error, Result};
use crate::ledger::{GroupLock, add_key};

const MD5_LEN: usize = 32;

/// Size class of groups created for uploads.
const UPLOAD_GROUP_CLASS: usize = 2;

/// Nodes sampled per round when looking for a group to upload into.
const UPLOAD_CANDIDATES: usize = 3;

/// Where a file can be fetched from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DownloadPlan {
    /// Online members holding the file.
    pub nodes: Vec<Peer>,
    /// The group those members belong to.
    pub group: Option<Group>,
    /// Online nodes holding the original.
    pub sources: Vec<Peer>,
}

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Adds a file uploaded by `src_node` to a group and hands the first
    /// transfer to that node. Returns the task id.
    ///
    /// When a group has to be found, `retries` bounds how many rounds of three
    /// ranked nodes are sampled (at least one). With `allow_no_source` the
    /// uploader is not recorded as the file's source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a malformed md5,
    /// [`Error::FileAlreadyExists`] if the file already converged,
    /// [`Error::InsufficientNodes`] if no group can take it and
    /// [`Error::TaskInProgress`] if another transfer is open.
    pub async fn add_p2p_file(
        &self,
        md5: &str,
        src_node: &str,
        size: u64,
        retries: usize,
        allow_no_source: bool,
    ) -> Result<u64> {
        if md5.len() != MD5_LEN {
            return Err(Error::InvalidArgument(format!("md5 {md5}")));
        }

        let existing = self
            .store()
            .files_by_md5(md5, Some(FileState::Normal))
            .await
            .map_err(Error::persistence)?
            .into_iter()
            .next();

        let existing = match existing {
            Some(file) if !file.is_new_add() => {
                Some(self.check_converged(file, src_node, allow_no_source).await?)
            }
            other => other,
        };

        let group = match &existing {
            Some(file) => self.group_for_existing(&file.group).await?,
            None => self.group_for_new(size, retries).await?,
        };

        let recorded_src = (!allow_no_source).then(|| src_node.to_string());
        let reference_ver = existing.as_ref().map_or(0, |file| file.ver);
        let add_lock = add_key(&group.id);

        let attached = self
            .with_lock(add_lock.clone(), async {
                let add_ver = self.next_version(&add_lock).await?;
                let file = GroupFile {
                    group: group.id.clone(),
                    md5: md5.to_string(),
                    size,
                    ver: 0,
                    state: FileState::Normal,
                    kind: FileKind::NewAdd,
                    add_ver,
                    src_node: recorded_src.clone(),
                    last_add_tm: unix_now(),
                };
                self.attach_file(&group, file, reference_ver, GroupLock::NotHeld)
                    .await
            })
            .await?;

        let now = unix_now();
        let open = self
            .store()
            .open_expand_nodes(&group.id, md5, now)
            .await
            .map_err(Error::persistence)?;
        if !open.is_empty() {
            return Err(Error::TaskInProgress {
                group: group.id.clone(),
                md5: md5.to_string(),
            });
        }

        let task = self
            .store()
            .upsert_expand_node(ExpandNode {
                id: 0,
                group: group.id.clone(),
                node: src_node.to_string(),
                md5: md5.to_string(),
                state: ExpandState::Notified,
                created_tm: now,
                timeout: now + secs(self.config().tasks.notified_lease),
                failed_times: 0,
                size,
                level: 0,
                ver: attached.ver,
            })
            .await
            .map_err(Error::persistence)?;
        info!("{} added to group {} by {}, task {}", md5, group.id, src_node, task);

        if let Some(file) = existing {
            if file.src_node.as_deref() != Some(src_node) {
                self.record_new_upload(&file, recorded_src).await?;
            }
        }

        Ok(task)
    }

    /// Where to fetch a file from.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn download(&self, md5: &str) -> Result<DownloadPlan> {
        self.download_more(md5, &[]).await
    }

    /// Where to fetch a file from, skipping groups that already failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn download_more(&self, md5: &str, excluded: &[String]) -> Result<DownloadPlan> {
        let (nodes, group) = self.peers(md5, excluded).await?;

        let origins = self
            .store()
            .source_nodes(md5, self.config().tasks.download_sources)
            .await
            .map_err(Error::persistence)?;
        let sources = self.online_nodes(&origins).await?;

        Ok(DownloadPlan {
            nodes,
            group,
            sources,
        })
    }

    /// Whether enough members hold a file to rebuild it. Nodes that took
    /// the file through unsafe distribution count too.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn is_available(&self, md5: &str) -> Result<bool> {
        let (nodes, group) = self.peers(md5, &[]).await?;
        let Some(group) = group else {
            return Ok(false);
        };

        let min = group.profile.min_pieces as usize;
        if nodes.len() >= min {
            return Ok(true);
        }

        let exclude: Vec<String> = nodes.into_iter().map(|peer| peer.id).collect();
        let needed = min - exclude.len();
        let unsafe_holders = self
            .store()
            .unsafe_holders(&group.id, md5, &exclude, needed)
            .await
            .map_err(Error::persistence)?;
        debug!(
            "{}: {} holders, {} unsafe of {} needed",
            md5,
            exclude.len(),
            unsafe_holders.len(),
            needed
        );

        Ok(unsafe_holders.len() >= needed)
    }

    /// Whether any group holds the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn is_exists(&self, md5: &str) -> Result<bool> {
        Ok(!self
            .store()
            .files_by_md5(md5, Some(FileState::Normal))
            .await
            .map_err(Error::persistence)?
            .is_empty())
    }

    /// [`Self::is_exists`] for several files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn is_exists_more(&self, md5s: &[String]) -> Result<HashMap<String, bool>> {
        let mut found = HashMap::with_capacity(md5s.len());
        for md5 in md5s {
            found.insert(md5.clone(), self.is_exists(md5).await?);
        }

        Ok(found)
    }

    /// Files of a group changed after `after`, in version order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn list_updated_files(
        &self,
        group_id: &str,
        after: u64,
        limit: usize,
        kind: FileKind,
    ) -> Result<Vec<GroupFile>> {
        self.store()
            .updated_files(group_id, after, limit, kind)
            .await
            .map_err(Error::persistence)
    }

    /// Stored checksum of a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn checksum(&self, md5: &str) -> Result<Option<String>> {
        self.store().checksum(md5).await.map_err(Error::persistence)
    }

    /// Stores the checksum of a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn update_checksum(&self, md5: &str, checksum: &str) -> Result<()> {
        self.store()
            .set_checksum(md5, checksum)
            .await
            .map_err(Error::persistence)
    }

    /// A node could not build pieces of a file: retire the file from the
    /// group and keep the report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnavailable`] if the group's ledger lock is
    /// contended.
    pub async fn invalid_file(&self, node: &str, group_id: &str, md5: &str) -> Result<()> {
        let Some(file) = self
            .store()
            .group_file(group_id, md5)
            .await
            .map_err(Error::persistence)?
        else {
            return Ok(());
        };

        if file.is_normal() {
            match self.delete_file(group_id, md5).await {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.store()
            .record_invalid_file(InvalidFileReport {
                node: node.to_string(),
                group: group_id.to_string(),
                md5: md5.to_string(),
                tm: unix_now(),
            })
            .await
            .map_err(Error::persistence)?;
        warn!("{} reported {} in group {} as invalid", node, md5, group_id);

        Ok(())
    }

    /// Whether a node may fetch a file: it belongs to a group holding the
    /// file or holds the original itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn can_download_file(&self, node: &str, md5: &str) -> Result<bool> {
        let files = self
            .store()
            .files_by_md5(md5, Some(FileState::Normal))
            .await
            .map_err(Error::persistence)?;
        let memberships = self
            .store()
            .node_memberships(node)
            .await
            .map_err(Error::persistence)?;

        if files.iter().any(|file| memberships.contains_key(&file.group)) {
            return Ok(true);
        }

        self.store()
            .has_source(node, md5)
            .await
            .map_err(Error::persistence)
    }

    /// Whether the original copy is still needed, i.e. no group finished
    /// the first propagation of the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn needs_origin_copy(&self, md5: &str) -> Result<bool> {
        let files = self
            .store()
            .files_by_md5(md5, Some(FileState::Normal))
            .await
            .map_err(Error::persistence)?;

        for file in files.iter().filter(|file| !file.is_new_add()) {
            let Some(group) = self
                .store()
                .get_group(&file.group)
                .await
                .map_err(Error::persistence)?
            else {
                continue;
            };
            if file.ver > 0 && file.ver <= group.first_finish_ver {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Deletes a file from every group holding it.
    ///
    /// # Errors
    ///
    /// Stops at the first group whose deletion failed.
    pub async fn delete_file_everywhere(&self, md5: &str) -> Result<usize> {
        let files = self
            .store()
            .files_by_md5(md5, Some(FileState::Normal))
            .await
            .map_err(Error::persistence)?;

        let mut deleted = 0;
        for file in &files {
            match self.delete_file(&file.group, md5).await {
                Ok(_) => deleted += 1,
                // Deleted concurrently since the scan
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(deleted)
    }

    /// Online holders of a file in the first usable group. Falls back to the
    /// last group looked at when none has enough holders.
    async fn peers(&self, md5: &str, excluded: &[String]) -> Result<(Vec<Peer>, Option<Group>)> {
        let files = self
            .store()
            .files_by_md5(md5, Some(FileState::Normal))
            .await
            .map_err(Error::persistence)?;

        let mut found = (Vec::new(), None);
        for file in files.iter().filter(|file| !excluded.contains(&file.group)) {
            let Some(group) = self
                .store()
                .get_group(&file.group)
                .await
                .map_err(Error::persistence)?
            else {
                continue;
            };
            let holders = self
                .store()
                .holders(&group.id, file.ver)
                .await
                .map_err(Error::persistence)?;

            let enough = holders.len() >= group.profile.min_pieces as usize;
            found = (holders, Some(group));
            if enough {
                break;
            }
        }

        Ok(found)
    }

    /// Fills in a missing source and rejects files that already converged.
    async fn check_converged(
        &self,
        file: GroupFile,
        src_node: &str,
        allow_no_source: bool,
    ) -> Result<GroupFile> {
        if !allow_no_source && file.src_node.is_none() {
            self.store()
                .put_group_file(GroupFile {
                    src_node: Some(src_node.to_string()),
                    ..file.clone()
                })
                .await
                .map_err(Error::persistence)?;
        }

        let group = self.require_group(&file.group).await?;
        let file = self.require_file(&file.group, &file.md5).await?;
        if file.ver <= group.first_finish_ver {
            return Err(Error::FileAlreadyExists(file.md5));
        }

        Ok(file)
    }

    async fn group_for_existing(&self, group_id: &str) -> Result<Group> {
        let group = self.require_group(group_id).await?;
        let online = self.online_at_first_finish(&group).await?;
        let required = self.placement_floor(&group);

        if online < required {
            return Err(Error::InsufficientNodes {
                available: online,
                required,
            });
        }

        Ok(group)
    }

    async fn group_for_new(&self, size: u64, retries: usize) -> Result<Group> {
        let small = size <= self.config().groups.small_file_size;

        if small {
            if let Some(id) = self.take_sticky_slot() {
                if let Some(group) = self
                    .store()
                    .get_group(&id)
                    .await
                    .map_err(Error::persistence)?
                {
                    return Ok(group);
                }
            }
        }

        let group = self.find_or_create_group(retries).await?;
        if small {
            *self.sticky().lock() = Some(StickyGroup {
                group: group.id.clone(),
                files: 0,
            });
        }

        Ok(group)
    }

    /// Counts one more file against the sticky group. Returns its id while it
    /// still takes files.
    fn take_sticky_slot(&self) -> Option<String> {
        let limit = self.config().groups.sticky_group_files;
        let mut slot = self.sticky().lock();

        match slot.as_mut() {
            Some(sticky) if sticky.files < limit => {
                sticky.files += 1;
                Some(sticky.group.clone())
            }
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    async fn find_or_create_group(&self, retries: usize) -> Result<Group> {
        let filter = self.placement_filter(None);
        let mut last = None;

        for round in 0..retries.max(1) {
            let candidates = self
                .store()
                .available_nodes(&filter, round * UPLOAD_CANDIDATES, UPLOAD_CANDIDATES)
                .await
                .map_err(Error::persistence)?;

            for node in &candidates {
                if let Some(group) = self.useful_group_of(node).await? {
                    return Ok(group);
                }
            }

            if last.is_none() {
                last = candidates.last().cloned();
            }
            if candidates.len() < UPLOAD_CANDIDATES {
                break;
            }
        }

        // The new group is seeded from the first round's sample
        let Some(last) = last else {
            return Err(Error::InsufficientNodes {
                available: 0,
                required: 1,
            });
        };

        let has_groups = !self
            .store()
            .node_groups(&last)
            .await
            .map_err(Error::persistence)?
            .is_empty();

        if !has_groups {
            let threshold = self.config().groups.new_node_threshold;
            let fresh = self
                .store()
                .count_available_nodes(&NodeFilter {
                    ungrouped_only: true,
                    ..self.placement_filter(None)
                })
                .await
                .map_err(Error::persistence)?;
            if fresh < threshold {
                debug!("{} ungrouped nodes, {} needed for a new group", fresh, threshold);
                return Err(Error::InsufficientNodes {
                    available: fresh,
                    required: threshold,
                });
            }
        }

        self.create_group(Some(UPLOAD_GROUP_CLASS), Some(&last))
            .await
    }

    /// A random group of `node` that has room and enough converged members.
    async fn useful_group_of(&self, node: &str) -> Result<Option<Group>> {
        let capacity = self.config().nodes.node_capacity;
        let groups = self
            .store()
            .node_groups(node)
            .await
            .map_err(Error::persistence)?;

        let mut useful = Vec::new();
        for group in groups.into_iter().filter(|group| !group.is_full(capacity)) {
            if self.online_at_first_finish(&group).await? >= self.placement_floor(&group) {
                useful.push(group);
            }
        }

        let mut rng = rand::thread_rng();
        Ok(useful.choose(&mut rng).cloned())
    }

    async fn online_at_first_finish(&self, group: &Group) -> Result<usize> {
        self.store()
            .members_at_version(&group.id, group.first_finish_ver, Some(MemberState::Online))
            .await
            .map_err(Error::persistence)
    }

    fn placement_floor(&self, group: &Group) -> usize {
        let safe = group.profile.safe_pieces;
        (safe + safe / self.config().groups.placement_divisor) as usize
    }

    /// Someone uploaded a file again: refresh its source and age.
    async fn record_new_upload(&self, file: &GroupFile, src_node: Option<String>) -> Result<()> {
        let Some(current) = self
            .store()
            .group_file(&file.group, &file.md5)
            .await
            .map_err(Error::persistence)?
        else {
            return Ok(());
        };
        if !current.is_normal() {
            return Ok(());
        }

        self.store()
            .put_group_file(GroupFile {
                src_node: src_node.or(current.src_node.clone()),
                last_add_tm: unix_now(),
                ..current
            })
            .await
            .map_err(Error::persistence)
    }
}
