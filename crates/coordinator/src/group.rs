//! Group membership: creation, expansion and the first-spread file entry
//! points.

use std::collections::HashSet;

use meshvault_locks::LockManager;
use meshvault_storage::{
    DataSource, FileKind, FileState, GROUP_PROFILES, Group, GroupFile, GroupNode,
};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, unix_now};
use crate::cooldown::CooldownKey;
use crate::error::{Error, Result};
use crate::jobs::BackgroundJob;
use crate::ledger::{GroupLock, SizeChange};

const GROUP_ID_LEN: usize = 32;

/// Result of an expansion attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expansion {
    /// Another caller checked this group within the cooldown window.
    Throttled,
    /// The group already had enough online members.
    Sufficient {
        /// Online members.
        online: usize,
    },
    /// Members were added and the group reached its perfect size.
    Expanded {
        /// Members added by this call.
        added: usize,
        /// Online members afterwards.
        online: usize,
    },
}

fn random_group_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GROUP_ID_LEN)
        .map(char::from)
        .collect()
}

/// Size class for a pool of `available` eligible nodes.
const fn class_for_pool(available: usize) -> usize {
    if available > 500 {
        2
    } else if available > 200 {
        1
    } else {
        0
    }
}

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Creates a group and expands it to its perfect size.
    ///
    /// Without a hint the size class follows the number of eligible nodes.
    /// `seed` is tried first as a member.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown class,
    /// [`Error::InsufficientNodes`] if fewer eligible nodes exist than the
    /// class's perfect size, and any error of the initial expansion. The
    /// group stays persisted if the expansion fails.
    pub async fn create_group(&self, class_hint: Option<usize>, seed: Option<&str>) -> Result<Group> {
        let ceiling = self.config().groups.creation_active_ceiling;
        let available = self
            .store()
            .count_available_nodes(&self.placement_filter(Some(ceiling)))
            .await
            .map_err(Error::persistence)?;

        let class = class_hint.unwrap_or_else(|| class_for_pool(available));
        let profile = *GROUP_PROFILES
            .get(class)
            .ok_or_else(|| Error::InvalidArgument(format!("size class {class}")))?;

        let required = profile.perfect_pieces as usize;
        if available < required {
            return Err(Error::InsufficientNodes {
                available,
                required,
            });
        }

        let group = Group {
            id: random_group_id(),
            class,
            profile,
            size: 0,
            first_finish_ver: 0,
            deleted_ver: 0,
            created_tm: unix_now(),
        };
        self.store()
            .insert_group(group.clone())
            .await
            .map_err(Error::persistence)?;
        info!("created group {} of class {}", group.id, class);

        self.expand_to_perfect_size(&group, ceiling, seed).await?;

        Ok(group)
    }

    /// Re-expands one group with the regular active-group ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown group and any error of
    /// [`Self::expand_to_perfect_size`].
    pub async fn expand_group(&self, group_id: &str) -> Result<Expansion> {
        let group = self.require_group(group_id).await?;
        self.expand_to_perfect_size(&group, self.config().groups.expansion_active_ceiling, None)
            .await
    }

    /// Tops a group up to its perfect size once its online members fall
    /// below `safe + min / divisor`. Checked at most once per cooldown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientNodes`] if the group is still below its
    /// perfect size after adding every usable candidate.
    pub async fn expand_to_perfect_size(
        &self,
        group: &Group,
        active_ceiling: u32,
        preferred: Option<&str>,
    ) -> Result<Expansion> {
        if !self.cooldown(CooldownKey::GroupExpansion(&group.id)).await? {
            return Ok(Expansion::Throttled);
        }

        let online = self.online_members(&group.id).await?;
        let profile = group.profile;
        let threshold = (profile.safe_pieces
            + profile.min_pieces / self.config().groups.expansion_divisor)
            as usize;

        if online >= threshold {
            return Ok(Expansion::Sufficient { online });
        }

        let perfect = profile.perfect_pieces as usize;
        debug!(
            "group {} has {} online members, expanding by {}",
            group.id,
            online,
            perfect - online
        );

        let added = self
            .expand_nodes(group, perfect - online, active_ceiling, preferred)
            .await?;
        let online = self.online_members(&group.id).await?;

        if online < perfect {
            warn!(
                "group {} stuck at {} of {} members",
                group.id, online, perfect
            );
            return Err(Error::InsufficientNodes {
                available: online,
                required: perfect,
            });
        }

        Ok(Expansion::Expanded { added, online })
    }

    /// Adds up to `count` candidates to `group`. Returns how many joined.
    ///
    /// Candidates are scanned page by page in weight order. Members, nodes
    /// without details and nodes sharing a /16 with a member are skipped.
    /// An empty page restarts the scan, a bounded number of times.
    /// `preferred` is offered ahead of every page, bypassing the ranking
    /// filter.
    ///
    /// # Errors
    ///
    /// Stops at the first failed insertion and returns its error; members
    /// added so far stay and are re-weighted.
    pub async fn expand_nodes(
        &self,
        group: &Group,
        count: usize,
        active_ceiling: u32,
        preferred: Option<&str>,
    ) -> Result<usize> {
        let members = self
            .store()
            .members(&group.id)
            .await
            .map_err(Error::persistence)?;
        let mut member_ids: HashSet<String> =
            members.into_iter().map(|member| member.node).collect();

        let ids: Vec<String> = member_ids.iter().cloned().collect();
        let mut prefixes: HashSet<String> = self
            .store()
            .get_nodes(&ids)
            .await
            .map_err(Error::persistence)?
            .iter()
            .filter_map(|detail| detail.peer.ip_prefix())
            .collect();

        let settings = &self.config().groups;
        let page = (count * settings.candidate_page_factor).max(1);
        let filter = self.candidate_filter(Some(active_ceiling));

        let preferred = preferred.map(ToString::to_string);
        let mut offset = 0;
        let mut rescans = 0;
        let mut added = 0;

        while added < count {
            let mut candidates = self
                .store()
                .available_nodes(&filter, offset, page)
                .await
                .map_err(Error::persistence)?;

            if candidates.is_empty() {
                rescans += 1;
                if rescans > settings.candidate_rescans {
                    debug!(
                        "group {}: candidates exhausted after {} added",
                        group.id, added
                    );
                    break;
                }
                offset = 0;
            } else {
                offset += page;
            }

            // Leads every page, empty ones included, until it joins or is
            // ruled out
            if let Some(first) = &preferred {
                candidates.insert(0, first.clone());
            }
            if candidates.is_empty() {
                continue;
            }

            let details = self
                .store()
                .get_nodes(&candidates)
                .await
                .map_err(Error::persistence)?;

            let mut batch = Vec::new();
            for id in candidates {
                if added >= count {
                    break;
                }
                if member_ids.contains(&id) {
                    continue;
                }
                let Some(detail) = details.iter().find(|detail| detail.id() == id) else {
                    debug!("candidate {} has no details", id);
                    continue;
                };
                let Some(prefix) = detail.peer.ip_prefix() else {
                    debug!("candidate {} has invalid ip {}", id, detail.peer.ip);
                    continue;
                };
                if prefixes.contains(&prefix) {
                    debug!("candidate {} shares {} with a member of {}", id, prefix, group.id);
                    continue;
                }

                if let Err(e) = self.add_node_to_group(&group.id, &id).await {
                    warn!("failed to add {} to group {}: {}", id, group.id, e);
                    self.schedule(BackgroundJob::Reweight(batch));
                    return Err(e);
                }

                member_ids.insert(id.clone());
                prefixes.insert(prefix);
                batch.push(id);
                added += 1;
            }

            debug!("group {}: {} joined in this batch", group.id, batch.len());
            self.schedule(BackgroundJob::Reweight(batch));
        }

        Ok(added)
    }

    /// Adds a file to a group as a first-spread record. Topping the group up
    /// and the first transfer run in the background.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnavailable`] if the group's ledger lock is
    /// contended.
    pub async fn add_file(
        &self,
        group_id: &str,
        md5: &str,
        src_node: Option<&str>,
        size: u64,
    ) -> Result<GroupFile> {
        let group = self.require_group(group_id).await?;

        let file = self
            .with_lock(group_id.to_string(), async {
                let ver = self.next_version(group_id).await?;
                let file = GroupFile {
                    group: group_id.to_string(),
                    md5: md5.to_string(),
                    size,
                    ver,
                    state: FileState::Normal,
                    kind: FileKind::FirstSpread,
                    add_ver: 0,
                    src_node: src_node.map(ToString::to_string),
                    last_add_tm: unix_now(),
                };
                self.attach_file(&group, file, ver, GroupLock::Held).await
            })
            .await?;

        self.schedule(BackgroundJob::SpreadNewFile {
            group: group_id.to_string(),
            md5: md5.to_string(),
        });

        Ok(file)
    }

    /// Marks a file deleted at a fresh version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group holds no live record of the
    /// file and [`Error::LockUnavailable`] if the ledger lock is contended.
    pub async fn delete_file(&self, group_id: &str, md5: &str) -> Result<u64> {
        let ver = self
            .with_lock(group_id.to_string(), async {
                let current = self.require_file(group_id, md5).await?;
                if !current.is_normal() {
                    return Err(Error::not_found(format!(
                        "live file {md5} in group {group_id}"
                    )));
                }

                let size = current.size;
                let ver = self.next_version(group_id).await?;
                self.store()
                    .put_group_file(GroupFile {
                        ver,
                        state: FileState::Deleted,
                        ..current
                    })
                    .await
                    .map_err(Error::persistence)?;
                self.store()
                    .set_deleted_ver(group_id, ver)
                    .await
                    .map_err(Error::persistence)?;
                self.update_group_size(group_id, size, SizeChange::Shrink)
                    .await?;
                Ok(ver)
            })
            .await?;

        info!("deleted {} from group {} at version {}", md5, group_id, ver);

        Ok(ver)
    }

    pub(crate) async fn add_node_to_group(&self, group_id: &str, node: &str) -> Result<()> {
        self.store()
            .add_member(group_id, GroupNode::joined(node))
            .await
            .map_err(Error::persistence)?;
        self.store()
            .increment_active_groups(node)
            .await
            .map_err(Error::persistence)?;

        self.schedule(BackgroundJob::ScheduleJoined {
            group: group_id.to_string(),
            node: node.to_string(),
        });

        Ok(())
    }

    /// Issues tasks for the first-spread files a new member is missing.
    pub(crate) async fn schedule_for_joined_node(&self, group_id: &str, node: &str) -> Result<()> {
        let member = self
            .store()
            .member(group_id, node)
            .await
            .map_err(Error::persistence)?
            .ok_or_else(|| Error::not_found(format!("member {node} of group {group_id}")))?;

        let files = self
            .store()
            .updated_files(
                group_id,
                member.ver,
                self.config().tasks.join_file_batch,
                FileKind::FirstSpread,
            )
            .await
            .map_err(Error::persistence)?;

        for file in files.iter().filter(|file| file.is_normal()) {
            if let Err(e) = self.gen_piece(group_id, Some(node), &file.md5).await {
                warn!("gen piece {} for new member {} failed: {}", file.md5, node, e);
            }
        }

        Ok(())
    }

    pub(crate) async fn online_members(&self, group_id: &str) -> Result<usize> {
        self.store()
            .online_member_count(group_id)
            .await
            .map_err(Error::persistence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_for_pool() {
        assert_eq!(class_for_pool(64), 0);
        assert_eq!(class_for_pool(200), 0);
        assert_eq!(class_for_pool(201), 1);
        assert_eq!(class_for_pool(500), 1);
        assert_eq!(class_for_pool(501), 2);
    }

    #[test]
    fn test_random_group_id() {
        let id = random_group_id();
        assert_eq!(id.len(), GROUP_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, random_group_id());
    }
}
