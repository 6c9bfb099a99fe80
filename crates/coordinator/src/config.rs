//! Coordinator configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Coordinator configuration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Background checker configuration
    pub checkers: CheckerConfig,

    /// Cooldown windows of throttled operations
    pub cooldowns: CooldownConfig,

    /// Group sizing and file placement
    pub groups: GroupConfig,

    /// Ledger lock configuration
    pub locks: LockConfig,

    /// Node liveness and selection
    pub nodes: NodeConfig,

    /// Expansion task configuration
    pub tasks: TaskConfig,

    /// Background worker pool
    pub workers: WorkerConfig,
}

/// Node liveness and selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// A node without an online heartbeat for this long is timed out
    pub liveness: Duration,

    /// Heartbeat recency required from expansion candidates
    pub candidate_liveness: Duration,

    /// Registration age required before a node is selected
    pub maturity: Duration,

    /// Nodes inactive for this long are deleted
    pub retention: Duration,

    /// Online reports required before a node gets a weight or is selected
    pub min_online_count: u32,

    /// Window over which online reports are counted
    pub online_count_window: Duration,

    /// Bytes each member lends to one group
    pub node_capacity: u64,

    /// Share of the disk lent by super nodes (percent)
    pub super_percent: u8,

    /// Share of the disk lent by normal nodes (percent)
    pub normal_percent: u8,

    /// A member reporting less than this share (percent) of its highest
    /// version is taken offline
    pub regression_percent: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            liveness: 10 * MINUTE,
            candidate_liveness: 2 * MINUTE,
            maturity: 7 * DAY,
            retention: 30 * DAY,
            min_online_count: 144,
            online_count_window: DAY,
            node_capacity: 2 * 1024 * 1024 * 1024,
            super_percent: 50,
            normal_percent: 1,
            regression_percent: 90,
        }
    }
}

/// Group sizing and file placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Active group ceiling for nodes joining an existing group
    pub expansion_active_ceiling: u32,

    /// Active group ceiling for nodes counted when creating a group
    pub creation_active_ceiling: u32,

    /// Expansion starts below `safe + min / expansion_divisor` online members
    pub expansion_divisor: u32,

    /// Files are only placed with `safe + safe / placement_divisor` online
    /// members at the first-finish version
    pub placement_divisor: u32,

    /// A version counts as propagated once `safe + safe / first_finish_divisor`
    /// online members reported it
    pub first_finish_divisor: u32,

    /// Candidates fetched per page, as a multiple of the nodes needed
    pub candidate_page_factor: usize,

    /// Rescans from the first page once the candidate list is exhausted
    pub candidate_rescans: usize,

    /// Size classes considered by automatic group creation
    pub auto_create_classes: Vec<usize>,

    /// Free space (percent) below which a new group is created
    pub balance_percent: u64,

    /// Ungrouped eligible nodes required before a new node seeds a group
    pub new_node_threshold: usize,

    /// Files up to this size share a sticky group
    pub small_file_size: u64,

    /// Files placed in a sticky group before another one is picked
    pub sticky_group_files: u32,

    /// NEW_ADD records older than this are dropped
    pub stale_new_file_age: Duration,

    /// Online member count at which task priority starts to rise
    pub level_start: usize,

    /// Online members per priority step
    pub level_step: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            expansion_active_ceiling: 11,
            creation_active_ceiling: 9,
            expansion_divisor: 16,
            placement_divisor: 16,
            first_finish_divisor: 32,
            candidate_page_factor: 10,
            candidate_rescans: 3,
            auto_create_classes: vec![2],
            balance_percent: 20,
            new_node_threshold: 208,
            small_file_size: 5 * 1024 * 1024,
            sticky_group_files: 100,
            stale_new_file_age: 7 * DAY,
            level_start: 160,
            level_step: 8,
        }
    }
}

/// Expansion task configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Deadline of INIT tasks
    pub init_lease: Duration,

    /// Deadline of NOTIFIED tasks
    pub notified_lease: Duration,

    /// Deadline of STARTED tasks, renewed by heartbeats
    pub started_lease: Duration,

    /// Open tasks allowed per (group, file)
    pub max_parallel_expansions: usize,

    /// Tasks handed out per heartbeat
    pub tasks_per_heartbeat: usize,

    /// Tasks older than this are purged
    pub retention: Duration,

    /// Tasks are reaped this long after their deadline
    pub timeout_grace: Duration,

    /// Files scheduled for a node that just joined a group
    pub join_file_batch: usize,

    /// Source nodes returned with a download plan
    pub download_sources: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            init_lease: 10 * MINUTE,
            notified_lease: 30 * MINUTE,
            started_lease: 10 * MINUTE,
            max_parallel_expansions: 1,
            tasks_per_heartbeat: 30,
            retention: 5 * DAY,
            timeout_grace: 10 * MINUTE,
            join_file_batch: 500,
            download_sources: 5,
        }
    }
}

/// Ledger lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock expiry
    pub ttl: Duration,

    /// Maximum wait for a contended lock
    pub wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            wait: Duration::from_secs(1),
        }
    }
}

/// Background checker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Delay before the node timeout reaper first runs
    pub startup_delay: Duration,

    /// Node timeout reaper interval
    pub node_timeout_interval: Duration,

    /// Nodes handled per timeout reaper batch
    pub node_batch: usize,

    /// Automatic group creation interval
    pub group_creation_interval: Duration,

    /// Task timeout reaper interval
    pub task_timeout_interval: Duration,

    /// Tasks handled per reaper batch
    pub task_batch: usize,

    /// Pause between stale node deletion rounds
    pub stale_node_interval: Duration,

    /// Pause between stale node batches within a round
    pub stale_node_batch_pause: Duration,

    /// Nodes deleted per batch
    pub stale_node_batch: usize,

    /// Online time aggregation interval
    pub online_time_interval: Duration,

    /// Node ids per aggregation page
    pub online_time_page: usize,

    /// Stale NEW_ADD cleanup interval
    pub stale_new_file_interval: Duration,

    /// Files handled per cleanup batch
    pub stale_new_file_batch: usize,

    /// Under-replicated group repair interval
    pub group_repair_interval: Duration,

    /// Runtime configuration refresh interval
    pub config_refresh_interval: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            startup_delay: 10 * MINUTE,
            node_timeout_interval: MINUTE,
            node_batch: 100,
            group_creation_interval: MINUTE,
            task_timeout_interval: Duration::from_secs(10),
            task_batch: 1000,
            stale_node_interval: 6 * HOUR,
            stale_node_batch_pause: MINUTE,
            stale_node_batch: 1000,
            online_time_interval: HOUR,
            online_time_page: 1000,
            stale_new_file_interval: 10 * MINUTE,
            stale_new_file_batch: 1000,
            group_repair_interval: 5 * MINUTE,
            config_refresh_interval: MINUTE,
        }
    }
}

/// Cooldown windows shared by every coordinator on the same store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    /// Node timeout reaper
    pub node_timeouts: Duration,

    /// Automatic group creation
    pub group_creation: Duration,

    /// Expansion of one group
    pub group_expansion: Duration,

    /// Online time aggregation
    pub online_time: Duration,

    /// Task timeout reaper
    pub task_timeouts: Duration,

    /// Task generation for one (group, file)
    pub gen_piece: Duration,

    /// Stale NEW_ADD cleanup
    pub stale_new_files: Duration,

    /// Under-replicated group repair
    pub group_repair: Duration,

    /// Stale node deletion
    pub stale_nodes: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            node_timeouts: MINUTE,
            group_creation: MINUTE,
            group_expansion: Duration::from_secs(30),
            online_time: HOUR,
            task_timeouts: Duration::from_secs(10),
            gen_piece: MINUTE,
            stale_new_files: 5 * MINUTE,
            group_repair: 5 * MINUTE,
            stale_nodes: HOUR,
        }
    }
}

impl CooldownConfig {
    /// No throttling at all; every gate opens.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            node_timeouts: Duration::ZERO,
            group_creation: Duration::ZERO,
            group_expansion: Duration::ZERO,
            online_time: Duration::ZERO,
            task_timeouts: Duration::ZERO,
            gen_piece: Duration::ZERO,
            stale_new_files: Duration::ZERO,
            group_repair: Duration::ZERO,
            stale_nodes: Duration::ZERO,
        }
    }
}

/// Background worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of workers
    pub workers: usize,

    /// Jobs queued before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}
