//! Driver interface and cluster configuration model for Arakoon consensus stores.
//!
//! The [`Driver`] trait is the seam between the retrying client and whatever
//! actually talks to the cluster. Any implementation that provides the same
//! operation set is interchangeable.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
mod error;
mod operation;
mod prefix;

pub use config::{ClusterConfig, ClusterEndpoints, ConfigFormat, ConfigRepr, NodeConfig, NodeEndpoint};
pub use error::Error;
pub use operation::{Consistency, Operation, RangeRequest};
pub use prefix::next_prefix;

use async_trait::async_trait;
use bytes::Bytes;

/// Low-level access to one Arakoon cluster.
///
/// Implementations report failures through [`Error`] and never retry on their
/// own; retry policy belongs to the client wrapping the driver.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Returns the value stored under `key`.
    async fn get(&self, key: &str, consistency: Consistency) -> Result<Bytes, Error>;

    /// Returns the values of all `keys`, failing with [`Error::NotFound`] if one is absent.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Bytes>, Error>;

    /// Returns the values of all `keys`, with `None` for absent ones.
    async fn multi_get_option(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, Error>;

    /// Stores `value` under `key`.
    async fn set(&self, key: &str, value: Bytes) -> Result<(), Error>;

    /// Removes `key`, failing with [`Error::NotFound`] if it is absent.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Replaces the value under `key` (removing it for `None`) and returns the previous value.
    async fn replace(&self, key: &str, value: Option<Bytes>) -> Result<Option<Bytes>, Error>;

    /// Removes every key starting with `prefix` and returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, Error>;

    /// Lists keys inside a bounded range.
    async fn range(&self, request: &RangeRequest) -> Result<Vec<String>, Error>;

    /// Lists key/value pairs inside a bounded range.
    async fn range_entries(&self, request: &RangeRequest) -> Result<Vec<(String, Bytes)>, Error>;

    /// Applies all operations atomically, or none of them.
    async fn sequence(&self, operations: &[Operation]) -> Result<(), Error>;

    /// Round trip to the master without touching any key.
    async fn nop(&self) -> Result<(), Error>;

    /// Returns whether `key` exists.
    async fn exists(&self, key: &str) -> Result<bool, Error>;

    /// Fails with [`Error::AssertionFailed`] unless the stored value equals `value`.
    async fn assert(&self, key: &str, value: Option<Bytes>) -> Result<(), Error>;

    /// Fails with [`Error::AssertionFailed`] unless `key` exists.
    async fn assert_exists(&self, key: &str) -> Result<(), Error>;

    /// Returns the name of the current master node, if one is elected.
    async fn who_is_master(&self) -> Result<Option<String>, Error>;

    /// Forgets the known master and closes open connections.
    async fn drop_connections(&self);
}
