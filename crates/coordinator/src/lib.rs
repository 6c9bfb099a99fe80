//! Replication control plane for a peer-to-peer file store.
//!
//! A [`Coordinator`] groups storage nodes into replication groups, assigns
//! each file to a group, versions the group's file ledger and schedules the
//! expansion tasks that spread every file to all members. Nodes drive it
//! through heartbeats; the [`Checkers`] converge whatever heartbeats alone
//! leave behind.
//!
//! Durable state and locking are collaborators injected at construction, see
//! [`meshvault_storage::DataSource`] and [`meshvault_locks::LockManager`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod checkers;
mod config;
mod config_set;
mod cooldown;
mod coordinator;
mod error;
mod files;
mod group;
mod jobs;
mod ledger;
mod registry;
mod scheduler;
mod workers;

pub use checkers::{Checker, Checkers, Pass};
pub use config::{
    CheckerConfig, CooldownConfig, CoordinatorConfig, GroupConfig, LockConfig, NodeConfig,
    TaskConfig, WorkerConfig,
};
pub use config_set::{ConfigKey, ConfigSet};
pub use cooldown::{CooldownGate, CooldownKey};
pub use coordinator::Coordinator;
pub use error::{Error, Result, SourceError};
pub use files::DownloadPlan;
pub use group::Expansion;
pub use registry::{Heartbeat, MemberView, node_weight};
pub use scheduler::{ExpandAssignment, GenPieceOutcome, UnsafeAssignment};
pub use workers::WorkerPool;
