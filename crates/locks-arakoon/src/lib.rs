//! Distributed lease locks stored in an Arakoon cluster.
//!
//! A lock is a JSON record under `/ovs/locks/<name>` holding the owner id and
//! an expiration timestamp. It is created and removed with assert-guarded
//! transactions, so at most one unexpired record exists per name.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod lock;
mod record;

pub use error::Error;
pub use lock::{
    ArakoonLock, DEFAULT_EXPIRATION, DEFAULT_POLL_INTERVAL, DEFAULT_REFRESH_INTERVAL,
    LOCK_PREFIX, LockConfig,
};
pub use record::LockRecord;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use ovs_arakoon_client::KeyValueClient;
use ovs_locks::{LockManager, LockStatus};
use tracing::{debug, instrument};

/// Hands out [`ArakoonLock`]s sharing one client and default configuration.
#[derive(Clone, Debug)]
pub struct ArakoonLockManager<C: KeyValueClient> {
    client: C,
    config: LockConfig,
    held: Arc<DashSet<String>>,
}

impl<C: KeyValueClient> ArakoonLockManager<C> {
    /// Creates a manager whose locks default to `config`.
    pub fn new(client: C, config: LockConfig) -> Self {
        Self {
            client,
            config,
            held: Arc::new(DashSet::new()),
        }
    }
}

#[async_trait]
impl<C: KeyValueClient> LockManager for ArakoonLockManager<C> {
    type Error = Error;
    type Lock = ArakoonLock<C>;

    fn lock(&self, name: &str, wait: Option<Duration>, expiration: Option<Duration>) -> Self::Lock {
        let config = LockConfig {
            wait: wait.or(self.config.wait),
            expiration: expiration.or(self.config.expiration),
            ..self.config.clone()
        };

        ArakoonLock::with_registry(self.client.clone(), name, config, Some(Arc::clone(&self.held)))
    }

    #[instrument(skip(self))]
    async fn check(&self, name: &str) -> Result<LockStatus, Self::Error> {
        let key = format!("{LOCK_PREFIX}{name}");
        let value = match self.client.get(&key).await {
            Ok(value) => value,
            Err(error) if error.is_not_found() => return Ok(LockStatus::Free),
            Err(error) => return Err(error.into()),
        };

        let status = match LockRecord::parse(&value) {
            Some(record) if !record.is_expired_at(record::now()) => LockStatus::Leased {
                local: self.held.contains(&record.id),
                holder: record.id,
            },
            _ => LockStatus::Free,
        };
        debug!(key = %key, status = ?status, "checked lock");

        Ok(status)
    }
}
