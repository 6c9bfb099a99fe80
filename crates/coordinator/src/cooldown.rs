//! Cooldown gates shared by every coordinator on the same store.

use std::fmt;
use std::time::Duration;

use meshvault_storage::CheckerStore;
use tracing::trace;

use crate::config::CooldownConfig;
use crate::error::{Error, Result};

/// A throttled activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownKey<'a> {
    /// Node timeout reaper.
    NodeTimeouts,
    /// Automatic group creation.
    GroupCreation,
    /// Expansion of one group.
    GroupExpansion(&'a str),
    /// Online time aggregation.
    OnlineTime,
    /// Task timeout reaper.
    TaskTimeouts,
    /// Task generation for one file of one group.
    GenPiece {
        /// Group id.
        group: &'a str,
        /// Content hash.
        md5: &'a str,
    },
    /// Stale NEW_ADD cleanup.
    StaleNewFiles,
    /// Under-replicated group repair.
    GroupRepair,
    /// Stale node deletion.
    StaleNodes,
}

impl fmt::Display for CooldownKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeTimeouts => f.write_str("checker_last_tm"),
            Self::GroupCreation => f.write_str("create_group_last_tm"),
            Self::GroupExpansion(group) => write!(f, "expand_prefix_{group}"),
            Self::OnlineTime => f.write_str("node_online_checker"),
            Self::TaskTimeouts => f.write_str("checker_expand_task_time"),
            Self::GenPiece { group, md5 } => write!(f, "gen_piece_{group}{md5}"),
            Self::StaleNewFiles => f.write_str("new_gf_timeout"),
            Self::GroupRepair => f.write_str("group_expand"),
            Self::StaleNodes => f.write_str("checker_delete_node"),
        }
    }
}

impl CooldownKey<'_> {
    const fn interval(self, config: &CooldownConfig) -> Duration {
        match self {
            Self::NodeTimeouts => config.node_timeouts,
            Self::GroupCreation => config.group_creation,
            Self::GroupExpansion(_) => config.group_expansion,
            Self::OnlineTime => config.online_time,
            Self::TaskTimeouts => config.task_timeouts,
            Self::GenPiece { .. } => config.gen_piece,
            Self::StaleNewFiles => config.stale_new_files,
            Self::GroupRepair => config.group_repair,
            Self::StaleNodes => config.stale_nodes,
        }
    }
}

/// Distributed cooldown gate: at most one caller per key and interval,
/// across every coordinator sharing the store.
#[derive(Clone, Debug)]
pub struct CooldownGate<S> {
    config: CooldownConfig,
    store: S,
}

impl<S> CooldownGate<S>
where
    S: CheckerStore,
{
    /// Creates a gate over the given store.
    pub const fn new(store: S, config: CooldownConfig) -> Self {
        Self { config, store }
    }

    /// Opens the gate for `key` if it was not opened within `interval`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the claim could not be recorded.
    pub async fn try_acquire_cooldown(&self, key: &str, interval: Duration) -> Result<bool> {
        let acquired = self
            .store
            .try_claim(key, interval)
            .await
            .map_err(Error::persistence)?;

        if !acquired {
            trace!("{} is cooling down", key);
        }

        Ok(acquired)
    }

    /// Opens the gate for a throttled activity using its configured interval.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the claim could not be recorded.
    pub async fn try_acquire(&self, key: CooldownKey<'_>) -> Result<bool> {
        self.try_acquire_cooldown(&key.to_string(), key.interval(&self.config))
            .await
    }
}
