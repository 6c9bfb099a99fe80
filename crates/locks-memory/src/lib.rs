//! In-memory (single process) implementation of expiring locks for local
//! development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshvault_locks::{LockManager, LockStatus, LockToken};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Held {
    expires_at: Instant,
    token: LockToken,
}

#[derive(Debug, Default)]
struct Table {
    held: HashMap<String, Held>,
    last_token: u64,
}

/// In-memory lock manager. Each key maps to its current holder and the
/// instant the lock expires.
#[derive(Clone, Debug, Default)]
pub struct MemoryLockManager {
    table: Arc<Mutex<Table>>,
}

impl MemoryLockManager {
    /// Creates a new instance of `MemoryLockManager`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_take(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let mut table = self.table.lock().await;
        let now = Instant::now();

        match table.held.get(key) {
            Some(held) if held.expires_at > now => None,
            _ => {
                table.last_token += 1;
                let token = LockToken(table.last_token);
                table.held.insert(
                    key.to_string(),
                    Held {
                        expires_at: now + ttl,
                        token,
                    },
                );
                Some(token)
            }
        }
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    type Error = Error;

    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error> {
        let now = Instant::now();

        Ok(match self.table.lock().await.held.get(&resource_id) {
            Some(held) if held.expires_at > now => LockStatus::Held(held.expires_at - now),
            _ => LockStatus::Free,
        })
    }

    async fn try_acquire(
        &self,
        key: String,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockToken>, Self::Error> {
        if ttl.is_zero() {
            return Err(Error::ZeroTtl(key));
        }

        let deadline = Instant::now() + wait;

        loop {
            if let Some(token) = self.try_take(&key, ttl).await {
                trace!("acquired lock {}", key);
                return Ok(Some(token));
            }

            let now = Instant::now();
            if now >= deadline {
                trace!("gave up waiting for lock {}", key);
                return Ok(None);
            }

            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn release(&self, resource_id: String, token: LockToken) -> Result<(), Self::Error> {
        let mut table = self.table.lock().await;

        match table.held.get(&resource_id) {
            Some(held) if held.token == token => {
                table.held.remove(&resource_id);
            }
            Some(_) => trace!("lock {} changed hands, not releasing", resource_id),
            None => {}
        }

        Ok(())
    }
}
