//! Background control loops.
//!
//! Each checker is a pass over persisted state that converges it a little.
//! Passes are gated by store-wide cooldowns, so several coordinators can run
//! the same loops without repeating work.

mod groups;
mod nodes;
mod tasks;

use std::time::Duration;

use meshvault_locks::LockManager;
use meshvault_storage::DataSource;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CheckerConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;

/// Outcome of one checker pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    /// Another pass ran within the cooldown window.
    Skipped,
    /// The pass ran and touched `processed` records.
    Completed {
        /// Records handled.
        processed: usize,
    },
}

/// The background checkers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Checker {
    /// Marks memberships of silent nodes offline and refills their groups.
    NodeTimeouts,
    /// Creates a group when a size class runs out of room.
    GroupCreation,
    /// Prunes or retries expired tasks.
    TaskTimeouts,
    /// Deletes nodes gone for longer than the retention window.
    StaleNodes,
    /// Aggregates how often nodes reported online.
    OnlineTime,
    /// Drops NEW_ADD files that never converged.
    StaleNewFiles,
    /// Refills groups that drifted below their safety threshold.
    GroupRepair,
    /// Reloads runtime tunables.
    ConfigRefresh,
}

impl Checker {
    /// Every checker.
    pub const ALL: [Self; 8] = [
        Self::NodeTimeouts,
        Self::GroupCreation,
        Self::TaskTimeouts,
        Self::StaleNodes,
        Self::OnlineTime,
        Self::StaleNewFiles,
        Self::GroupRepair,
        Self::ConfigRefresh,
    ];

    /// Name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NodeTimeouts => "node-timeouts",
            Self::GroupCreation => "group-creation",
            Self::TaskTimeouts => "task-timeouts",
            Self::StaleNodes => "stale-nodes",
            Self::OnlineTime => "online-time",
            Self::StaleNewFiles => "stale-new-files",
            Self::GroupRepair => "group-repair",
            Self::ConfigRefresh => "config-refresh",
        }
    }

    const fn period(self, config: &CheckerConfig) -> Duration {
        match self {
            Self::NodeTimeouts => config.node_timeout_interval,
            Self::GroupCreation => config.group_creation_interval,
            Self::TaskTimeouts => config.task_timeout_interval,
            Self::StaleNodes => config.stale_node_interval,
            Self::OnlineTime => config.online_time_interval,
            Self::StaleNewFiles => config.stale_new_file_interval,
            Self::GroupRepair => config.group_repair_interval,
            Self::ConfigRefresh => config.config_refresh_interval,
        }
    }

    /// Nodes need a full liveness window of heartbeats before timeouts and
    /// group balance mean anything.
    const fn startup_delay(self, config: &CheckerConfig) -> Duration {
        match self {
            Self::NodeTimeouts | Self::GroupCreation => config.startup_delay,
            _ => Duration::ZERO,
        }
    }
}

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Runs one pass of a checker.
    ///
    /// # Errors
    ///
    /// Returns the first error that stopped the pass.
    pub async fn run_checker(&self, checker: Checker) -> Result<Pass> {
        match checker {
            Checker::NodeTimeouts => self.reap_timed_out_nodes().await,
            Checker::GroupCreation => self.create_groups_if_needed().await,
            Checker::TaskTimeouts => self.reap_timed_out_tasks().await,
            Checker::StaleNodes => self.delete_stale_nodes().await,
            Checker::OnlineTime => self.aggregate_online_time().await,
            Checker::StaleNewFiles => self.clean_stale_new_files().await,
            Checker::GroupRepair => self.repair_groups().await,
            Checker::ConfigRefresh => {
                let processed = self.refresh_settings().await?;
                Ok(Pass::Completed { processed })
            }
        }
    }
}

/// Runs every checker on its own interval until shut down.
pub struct Checkers<D, L>
where
    D: DataSource,
    L: LockManager,
{
    coordinator: Coordinator<D, L>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<D, L> std::fmt::Debug for Checkers<D, L>
where
    D: DataSource,
    L: LockManager,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkers")
            .field("running", &self.handles.lock().len())
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<D, L> Checkers<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Creates the service. Nothing runs until [`Self::start`].
    #[must_use]
    pub fn new(coordinator: Coordinator<D, L>) -> Self {
        Self {
            coordinator,
            handles: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns one loop per checker. Starting twice is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("checkers already running");
            return;
        }

        for checker in Checker::ALL {
            handles.push(self.spawn(checker));
        }
        info!("started {} checkers", handles.len());
    }

    /// Stops every loop and waits for them to exit. A pass in progress is
    /// abandoned at its next await point.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.wait().await;
        info!("checkers stopped");
    }

    /// Waits until every loop exited.
    pub async fn wait(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("checker panicked: {}", e);
            }
        }
    }

    fn spawn(&self, checker: Checker) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        let config = &coordinator.config().checkers;
        let period = checker.period(config).max(Duration::from_millis(1));
        let start = Instant::now() + checker.startup_delay(config);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            pass = coordinator.run_checker(checker) => match pass {
                                Ok(pass) => debug!("{}: {:?}", checker.name(), pass),
                                Err(e) => warn!("{} failed: {}", checker.name(), e),
                            },
                        }
                    }
                }
            }

            debug!("{} stopped", checker.name());
        })
    }
}
