use meshvault_locks::LockManager;
use meshvault_storage::DataSource;
use tracing::{debug, info, warn};

use super::Pass;
use crate::coordinator::Coordinator;
use crate::cooldown::CooldownKey;
use crate::error::{Error, Result};

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Creates a group in the fullest auto-created class once its free space
    /// drops below the balance threshold.
    ///
    /// A class without any non-full group counts as having no free space.
    pub(crate) async fn create_groups_if_needed(&self) -> Result<Pass> {
        if !self.cooldown(CooldownKey::GroupCreation).await? {
            return Ok(Pass::Skipped);
        }

        let groups = &self.config().groups;
        let usage = self
            .store()
            .class_usage(self.config().nodes.node_capacity)
            .await
            .map_err(Error::persistence)?;

        let Some((class, free)) = groups
            .auto_create_classes
            .iter()
            .map(|class| (*class, usage.get(class).map_or(0, |u| u.free_percent())))
            .min_by_key(|(_, free)| *free)
        else {
            return Ok(Pass::Completed { processed: 0 });
        };

        if free >= groups.balance_percent {
            debug!("class {} has {}% free", class, free);
            return Ok(Pass::Completed { processed: 0 });
        }

        match self.create_group(Some(class), None).await {
            Ok(group) => {
                info!("class {} at {}% free, created group {}", class, free, group.id);
                Ok(Pass::Completed { processed: 1 })
            }
            Err(e @ Error::InsufficientNodes { .. }) => {
                warn!("class {} at {}% free but no group created: {}", class, free, e);
                Ok(Pass::Completed { processed: 0 })
            }
            Err(e) => Err(e),
        }
    }

    /// Re-expands every group whose online members fell below its expansion
    /// threshold.
    pub(crate) async fn repair_groups(&self) -> Result<Pass> {
        if !self.cooldown(CooldownKey::GroupRepair).await? {
            return Ok(Pass::Skipped);
        }

        let counts = self
            .store()
            .online_member_counts()
            .await
            .map_err(Error::persistence)?;
        let groups = self.store().groups().await.map_err(Error::persistence)?;
        let divisor = self.config().groups.expansion_divisor;
        let ceiling = self.config().groups.expansion_active_ceiling;
        let mut processed = 0;

        for group in &groups {
            let online = counts.get(&group.id).copied().unwrap_or(0);
            let threshold = (group.profile.safe_pieces + group.profile.min_pieces / divisor) as usize;
            if online >= threshold {
                continue;
            }

            processed += 1;
            match self.expand_to_perfect_size(group, ceiling, None).await {
                Ok(expansion) => debug!("repaired {}: {:?}", group.id, expansion),
                Err(e) => warn!("repairing {} failed: {}", group.id, e),
            }
        }

        Ok(Pass::Completed { processed })
    }
}
