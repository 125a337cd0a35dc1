//! In-memory (single process) implementation of locks for local development.
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
use ovs_locks::{Lock, LockManager, LockStatus};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::debug;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone, Debug, PartialEq, Eq)]
struct Holder {
    manager: Uuid,
    lock: Uuid,
}

type Holders = Arc<Mutex<HashMap<String, Holder>>>;

/// In-memory lock manager.
///
/// Clones share the same lock table; locks never expire.
#[derive(Clone, Debug)]
pub struct MemoryLockManager {
    holders: Holders,
    identifier: Uuid,
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLockManager {
    /// Creates a new instance of `MemoryLockManager`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            holders: Arc::new(Mutex::new(HashMap::new())),
            identifier: Uuid::new_v4(),
        }
    }

    /// A manager sharing this one's lock table but with its own identity,
    /// as a second process would have.
    #[must_use]
    pub fn peer(&self) -> Self {
        Self {
            holders: Arc::clone(&self.holders),
            identifier: Uuid::new_v4(),
        }
    }
}

/// A lock from [`MemoryLockManager`].
#[derive(Debug)]
pub struct MemoryLock {
    name: String,
    holder: Holder,
    holders: Holders,
    wait: Option<Duration>,
}

#[async_trait]
impl Lock for MemoryLock {
    type Error = Error;

    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, wait: Option<Duration>) -> Result<(), Self::Error> {
        let wait = wait.or(self.wait);
        let started = Instant::now();

        loop {
            {
                let mut holders = self.holders.lock().await;
                match holders.get(&self.name) {
                    Some(holder) if *holder == self.holder => return Ok(()),
                    Some(_) => {}
                    None => {
                        holders.insert(self.name.clone(), self.holder.clone());
                        debug!(name = %self.name, "lock acquired");
                        return Ok(());
                    }
                }
            }

            let waited = started.elapsed();
            if wait.is_some_and(|wait| waited > wait) {
                return Err(Error::NoLockAvailable {
                    name: self.name.clone(),
                    waited,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn release(&self) -> Result<(), Self::Error> {
        let mut holders = self.holders.lock().await;
        if holders.get(&self.name) == Some(&self.holder) {
            holders.remove(&self.name);
            debug!(name = %self.name, "lock released");
        }

        Ok(())
    }

    async fn is_held(&self) -> bool {
        self.holders.lock().await.get(&self.name) == Some(&self.holder)
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    type Error = Error;
    type Lock = MemoryLock;

    fn lock(&self, name: &str, wait: Option<Duration>, _expiration: Option<Duration>) -> Self::Lock {
        MemoryLock {
            name: name.to_string(),
            holder: Holder {
                manager: self.identifier,
                lock: Uuid::new_v4(),
            },
            holders: Arc::clone(&self.holders),
            wait,
        }
    }

    async fn check(&self, name: &str) -> Result<LockStatus, Self::Error> {
        Ok(match self.holders.lock().await.get(name) {
            None => LockStatus::Free,
            Some(holder) => LockStatus::Leased {
                holder: holder.lock.to_string(),
                local: holder.manager == self.identifier,
            },
        })
    }
}
