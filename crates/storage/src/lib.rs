//! Data model and persistence contracts for the replication coordinator.
//!
//! Durable state is reached through small capability traits ([`NodeStore`],
//! [`GroupStore`], [`FileStore`], [`TaskStore`], [`CheckerStore`],
//! [`ConfigStore`]) that share one error type via [`Backend`]. Anything that
//! implements all of them is a [`DataSource`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod checker;
mod file;
mod group;
mod node;
mod task;

pub use checker::{CheckerStore, ConfigStore, NodeCheckpoint, TaskCheckpoint};
pub use file::{FileKind, FileState, FileStore, GroupFile, InvalidFileReport, PLACEHOLDER_MD5};
pub use group::{
    ClassUsage, GROUP_PROFILES, Group, GroupNode, GroupStore, MemberState, PieceProfile,
};
pub use node::{NodeDetail, NodeFilter, NodeReport, NodeStore, Peer};
pub use task::{ExpandNode, ExpandState, TaskStore, UnsafeExpandNode, UnsafeExpandState};

use std::error::Error;
use std::fmt::Debug;

/// Marker trait for storage errors
pub trait StorageError: Debug + Error + Send + Sync + 'static {}

/// Shared base of every capability trait: one backend, one error type.
pub trait Backend: Clone + Send + Sync + 'static {
    /// The error type for storage operations.
    type Error: StorageError;
}

/// The complete persistence collaborator.
///
/// This trait is automatically implemented for types that implement every
/// capability trait.
pub trait DataSource:
    NodeStore + GroupStore + FileStore + TaskStore + CheckerStore + ConfigStore
{
}

impl<T> DataSource for T where
    T: NodeStore + GroupStore + FileStore + TaskStore + CheckerStore + ConfigStore
{
}
