use std::time::Duration;

use ovs_locks::LockError;
use thiserror::Error;

/// Errors returned by in-memory locks.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The lock stayed taken for the whole wait budget.
    #[error("could not acquire lock {name} within {waited:?}")]
    NoLockAvailable {
        /// Name of the lock.
        name: String,
        /// Time spent waiting.
        waited: Duration,
    },
}

impl LockError for Error {
    fn is_unavailable(&self) -> bool {
        matches!(self, Self::NoLockAvailable { .. })
    }
}
