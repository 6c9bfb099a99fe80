//! Abstract interface for keyed, expiring mutual exclusion across coordinators.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// Marker trait for `LockManager` errors
pub trait LockManagerError: Debug + Error + Send + Sync + 'static {}

/// Represents the current status of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free (never taken, released, or expired).
    Free,

    /// The lock is held and will expire after the given duration at the latest.
    Held(Duration),
}

/// Proof of holding a lock, handed out by a successful acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(pub u64);

/// A keyed lock service where every lock carries a TTL.
///
/// A holder that crashes never releases its lock; the TTL bounds how long the
/// key stays unavailable. Acquisition waits at most `wait` before giving up,
/// so callers never block indefinitely on a contended key.
#[async_trait]
pub trait LockManager: Clone + Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockManagerError;

    /// Checks the status of a lock.
    ///
    /// # Arguments
    /// * `resource_id`: The unique identifier for the resource.
    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error>;

    /// Attempts to acquire a lock, retrying until `wait` has elapsed.
    ///
    /// Returns the holder's token if the lock was taken, `None` if it was
    /// still held by someone else when the wait budget ran out.
    ///
    /// # Arguments
    /// * `resource_id`: A unique identifier for the resource to be locked.
    /// * `ttl`: How long the lock stays valid without an explicit release.
    /// * `wait`: Upper bound on the time spent waiting for the lock.
    async fn try_acquire(
        &self,
        resource_id: String,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockToken>, Self::Error>;

    /// Releases a lock held under `token`. Releasing a free lock, or one that
    /// expired and was taken by another holder, is a no-op.
    ///
    /// # Arguments
    /// * `resource_id`: The unique identifier for the resource.
    /// * `token`: The token returned when the lock was acquired.
    async fn release(&self, resource_id: String, token: LockToken) -> Result<(), Self::Error>;
}
