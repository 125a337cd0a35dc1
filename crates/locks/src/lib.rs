//! Lease locks shared between processes.
//!
//! A lock is held through a lease that lapses after its expiration unless it
//! is released first. Backends decide where the lease lives.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::time::Duration;

use async_trait::async_trait;

/// Errors raised by a lock backend.
pub trait LockError: std::error::Error + Send + Sync + 'static {
    /// Whether the wait budget ran out while someone else kept the lease.
    fn is_unavailable(&self) -> bool;
}

/// What the backing store says about a lock's lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// No live lease: never taken, released, or expired.
    Free,

    /// A live lease.
    Leased {
        /// Identifier of the lock instance owning the lease.
        holder: String,

        /// Whether the owner came from the manager that was asked.
        local: bool,
    },
}

impl LockStatus {
    /// Whether the lock can be taken right away.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }
}

/// One named lock, owned by a single lease holder at a time.
///
/// A lock starts out unlocked. [`Lock::acquire`] blocks until a lease is
/// obtained or the wait budget runs out; [`Lock::release`] gives it back.
/// Both are idempotent for the instance holding the lease.
#[async_trait]
pub trait Lock: Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockError;

    /// Name shared by every instance contending for this lock.
    fn name(&self) -> &str;

    /// Acquires the lock, waiting at most `wait` (or the lock's configured
    /// wait when `None`). Returns immediately if this instance still holds a
    /// live lease; a lease lost in the meantime is contended for again.
    ///
    /// # Arguments
    /// * `wait`: Upper bound on the time spent waiting for the current holder.
    async fn acquire(&self, wait: Option<Duration>) -> Result<(), Self::Error>;

    /// Gives the lease back. Does nothing when this instance holds none, and a
    /// lease already taken over by someone else counts as released.
    async fn release(&self) -> Result<(), Self::Error>;

    /// Whether this instance currently believes it holds the lock.
    async fn is_held(&self) -> bool;
}

/// Hands out [`Lock`] instances bound to one backing store.
#[async_trait]
pub trait LockManager: Clone + Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockError;

    /// The lock type handed out by this manager.
    type Lock: Lock<Error = Self::Error>;

    /// Creates an unlocked instance of the lock called `name`.
    ///
    /// # Arguments
    /// * `name`: The unique name of the lock.
    /// * `wait`: Default wait budget for [`Lock::acquire`], `None` waits forever.
    /// * `expiration`: How long a held lock stays valid without being refreshed
    ///   or released, for backends that expire abandoned locks.
    fn lock(&self, name: &str, wait: Option<Duration>, expiration: Option<Duration>) -> Self::Lock;

    /// Reads the current lease of the lock called `name`.
    async fn check(&self, name: &str) -> Result<LockStatus, Self::Error>;
}
