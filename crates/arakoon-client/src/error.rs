use thiserror::Error;

use crate::TransactionId;

/// Errors returned by Arakoon clients.
#[derive(Debug, Error)]
pub enum Error {
    /// Error reported by the driver and not absorbed by the retry policy.
    #[error(transparent)]
    Arakoon(#[from] ovs_arakoon::Error),

    /// A transient socket error that persisted after the single retry.
    #[error("{call} failed after retrying a transient socket error: {source}")]
    Transport {
        /// Name of the failed call.
        call: &'static str,
        /// Error of the retried attempt.
        #[source]
        source: ovs_arakoon::Error,
    },

    /// The transaction was never started, or was already applied or discarded.
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    /// No pooled client could be checked out.
    #[error("no client available in the pool")]
    PoolUnavailable,
}

impl Error {
    /// Whether the key was absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Arakoon(ovs_arakoon::Error::NotFound(_)))
    }

    /// Whether an assert did not hold.
    #[must_use]
    pub const fn is_assertion_failed(&self) -> bool {
        matches!(self, Self::Arakoon(ovs_arakoon::Error::AssertionFailed(_)))
    }
}
