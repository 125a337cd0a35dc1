use std::time::Duration;

use ovs_locks::LockError;
use thiserror::Error;

/// Errors that can occur when using Arakoon locks.
#[derive(Debug, Error)]
pub enum Error {
    /// The lock stayed taken for the whole wait budget.
    #[error("could not acquire lock {key} within {waited:?}")]
    NoLockAvailable {
        /// Key of the lock record.
        key: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// Another party reclaimed the lock while it was held.
    #[error("lock lost: {0}")]
    LockLost(String),

    /// The key/value store failed.
    #[error(transparent)]
    Client(#[from] ovs_arakoon_client::Error),

    /// A lock record could not be encoded.
    #[error("lock record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LockError for Error {
    fn is_unavailable(&self) -> bool {
        matches!(self, Self::NoLockAvailable { .. })
    }
}
