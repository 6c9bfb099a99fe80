//! Per-group file records and version counters.
//!
//! Every mutation that reads and then writes a group's file records runs
//! under the group's ledger lock. Versions come from the store's atomic
//! counter and may be read without the lock.

use meshvault_locks::LockManager;
use meshvault_storage::{DataSource, FileKind, FileState, Group, GroupFile, PLACEHOLDER_MD5};
use tracing::{debug, info};

use crate::coordinator::{Coordinator, unix_now};
use crate::error::{Error, Result};

/// Lock and counter key of the NEW_ADD side of a group.
pub(crate) fn add_key(group: &str) -> String {
    format!("add_{group}")
}

/// Sampled resync: sizes ending in 0, 1 or 2 recount the group from its
/// records instead of applying the delta.
const fn needs_recount(size: u64) -> bool {
    size % 10 < 3
}

/// Direction of a size change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SizeChange {
    Grow,
    Shrink,
}

/// Whether the caller already holds the group's ledger lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GroupLock {
    Held,
    NotHeld,
}

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Draws the next version of a group. Successive calls return strictly
    /// increasing values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the counter could not be incremented.
    pub async fn next_version(&self, group: &str) -> Result<u64> {
        self.store()
            .next_version(group)
            .await
            .map_err(Error::persistence)
    }

    /// Bumps the version of a file that has not completed its first
    /// propagation, so members re-fetch it. Returns the new version, or
    /// `None` if the file already converged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group or file does not exist and
    /// [`Error::LockUnavailable`] if the ledger lock is contended.
    pub async fn incr_group_file_ver(&self, group_id: &str, md5: &str) -> Result<Option<u64>> {
        let file = self.require_file(group_id, md5).await?;
        let group = self.require_group(group_id).await?;

        if file.ver <= group.first_finish_ver {
            return Ok(None);
        }

        self.with_lock(group_id.to_string(), async {
            let ver = self.next_version(group_id).await?;
            // Re-read under the lock so concurrent writers are not undone
            let current = self.require_file(group_id, md5).await?;
            self.store()
                .put_group_file(GroupFile { ver, ..current })
                .await
                .map_err(Error::persistence)?;

            debug!("bumped {} in group {} to version {}", md5, group_id, ver);
            Ok(Some(ver))
        })
        .await
    }

    /// Raises the group's first-finish watermark to the highest version held
    /// by enough online members. Returns the watermark.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group does not exist.
    pub async fn refresh_first_finish_ver(&self, group_id: &str) -> Result<u64> {
        let group = self.require_group(group_id).await?;
        let members = self
            .store()
            .members(group_id)
            .await
            .map_err(Error::persistence)?;

        let profile = group.profile;
        let required = (profile.safe_pieces
            + profile.safe_pieces / self.config().groups.first_finish_divisor)
            as usize;

        let mut versions: Vec<u64> = members
            .iter()
            .filter(|member| member.is_online())
            .map(|member| member.ver)
            .collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = required
            .checked_sub(1)
            .and_then(|index| versions.get(index))
            .copied()
            .unwrap_or_default();

        if candidate <= group.first_finish_ver {
            return Ok(group.first_finish_ver);
        }

        self.store()
            .set_first_finish_ver(group_id, candidate)
            .await
            .map_err(Error::persistence)?;
        info!(
            "group {} first finish version {} -> {}",
            group_id, group.first_finish_ver, candidate
        );

        Ok(candidate)
    }

    /// Stores `file` in its group unless a NORMAL record already exists.
    /// Returns the record as stored.
    pub(crate) async fn attach_file(
        &self,
        group: &Group,
        file: GroupFile,
        reference_ver: u64,
        lock: GroupLock,
    ) -> Result<GroupFile> {
        let existing = self
            .store()
            .group_file(&group.id, &file.md5)
            .await
            .map_err(Error::persistence)?;

        match existing {
            Some(current) if current.is_normal() => {
                debug!("{} already attached to group {}", file.md5, group.id);
                Ok(current)
            }
            Some(_) => {
                self.store()
                    .put_group_file(file.clone())
                    .await
                    .map_err(Error::persistence)?;
                if reference_ver >= group.first_finish_ver {
                    self.fill_placeholder(&group.id, lock).await?;
                }
                self.update_group_size(&group.id, file.size, SizeChange::Grow)
                    .await?;
                Ok(file)
            }
            None => {
                self.store()
                    .put_group_file(file.clone())
                    .await
                    .map_err(Error::persistence)?;
                self.update_group_size(&group.id, file.size, SizeChange::Grow)
                    .await?;
                Ok(file)
            }
        }
    }

    /// Moves the group's placeholder record to a fresh version, so every
    /// member resyncs.
    pub(crate) async fn fill_placeholder(&self, group_id: &str, lock: GroupLock) -> Result<u64> {
        match lock {
            GroupLock::Held => self.bump_placeholder(group_id).await,
            GroupLock::NotHeld => {
                self.with_lock(group_id.to_string(), self.bump_placeholder(group_id))
                    .await
            }
        }
    }

    async fn bump_placeholder(&self, group_id: &str) -> Result<u64> {
        let ver = self.next_version(group_id).await?;
        let existing = self
            .store()
            .group_file(group_id, PLACEHOLDER_MD5)
            .await
            .map_err(Error::persistence)?;

        let placeholder = match existing {
            Some(current) => GroupFile {
                ver,
                last_add_tm: unix_now(),
                ..current
            },
            None => GroupFile {
                group: group_id.to_string(),
                md5: PLACEHOLDER_MD5.to_string(),
                size: 0,
                ver,
                state: FileState::Deleted,
                kind: FileKind::FirstSpread,
                add_ver: 0,
                src_node: None,
                last_add_tm: unix_now(),
            },
        };

        self.store()
            .put_group_file(placeholder)
            .await
            .map_err(Error::persistence)?;
        debug!("placeholder of group {} moved to version {}", group_id, ver);

        Ok(ver)
    }

    pub(crate) async fn update_group_size(
        &self,
        group_id: &str,
        size: u64,
        change: SizeChange,
    ) -> Result<()> {
        if needs_recount(size) {
            self.store()
                .recalculate_group_size(group_id)
                .await
                .map_err(Error::persistence)?;
            return Ok(());
        }

        let delta = i64::try_from(size).unwrap_or(i64::MAX);
        let delta = match change {
            SizeChange::Grow => delta,
            SizeChange::Shrink => -delta,
        };

        self.store()
            .adjust_group_size(group_id, delta)
            .await
            .map_err(Error::persistence)
    }

    pub(crate) async fn require_group(&self, group_id: &str) -> Result<Group> {
        self.store()
            .get_group(group_id)
            .await
            .map_err(Error::persistence)?
            .ok_or_else(|| Error::not_found(format!("group {group_id}")))
    }

    pub(crate) async fn require_file(&self, group_id: &str, md5: &str) -> Result<GroupFile> {
        self.store()
            .group_file(group_id, md5)
            .await
            .map_err(Error::persistence)?
            .ok_or_else(|| Error::not_found(format!("file {md5} in group {group_id}")))
    }
}
