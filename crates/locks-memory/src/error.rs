use meshvault_locks::LockManagerError;
use thiserror::Error;

/// Errors from the in-memory lock manager.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A zero TTL would make the lock expire as soon as it is taken.
    #[error("lock ttl for `{0}` must be greater than zero")]
    ZeroTtl(String),
}

impl LockManagerError for Error {}
