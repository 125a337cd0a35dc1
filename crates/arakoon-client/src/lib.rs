//! Retrying Arakoon client with staged transactions and a bounded client pool.
//!
//! [`ArakoonClient`] serializes all calls through one mutex, retries transient
//! socket failures once and master elections with exponential back-off.
//! [`ArakoonPool`] spreads calls over several clients. Both implement
//! [`KeyValueClient`], which is what higher layers program against.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod error;
mod pool;
mod transactions;

pub use client::{
    ArakoonClient, ClientConfig, DEFAULT_BATCH_SIZE, DEFAULT_MASTER_RETRIES,
    DEFAULT_MASTER_RETRY_INTERVAL, DEFAULT_MASTER_RETRY_MULTIPLIER, DEFAULT_MAX_DURATION,
    DEFAULT_SOCKET_RETRY_DELAY, DEFAULT_TRANSACTION_MAX_DURATION,
};
pub use error::Error;
pub use pool::{ArakoonPool, DEFAULT_POOL_SIZE, PoolConfig};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use ovs_arakoon::{Consistency, RangeRequest, next_prefix};
use tokio_stream::Stream;
use tracing::warn;
use uuid::Uuid;

/// Identifier of a staged transaction.
pub type TransactionId = Uuid;

/// Lazily fetched keys.
pub type KeyStream<'a> = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send + 'a>>;

/// Lazily fetched key/value pairs.
pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<(String, Bytes), Error>> + Send + 'a>>;

/// Lazily fetched values, `None` for absent keys.
pub type ValueStream<'a> = Pin<Box<dyn Stream<Item = Result<Option<Bytes>, Error>> + Send + 'a>>;

/// Upper bound for the random wait between callback transaction attempts.
pub const MAX_CALLBACK_RETRY_WAIT: Duration = Duration::from_millis(250);

/// Outcome of one optimistic attempt: committed, or lost to a concurrent writer.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The attempt went through.
    Done(T),

    /// An assert did not hold; the attempt can be rebuilt and retried.
    Conflict(Error),
}

impl<T> Attempt<T> {
    /// Separates assertion conflicts from real failures.
    ///
    /// # Errors
    ///
    /// Passes through every error except [`Error::is_assertion_failed`] ones.
    pub fn classify(result: Result<T, Error>) -> Result<Self, Error> {
        match result {
            Ok(value) => Ok(Self::Done(value)),
            Err(error) if error.is_assertion_failed() => Ok(Self::Conflict(error)),
            Err(error) => Err(error),
        }
    }
}

/// Random wait in `[0, MAX_CALLBACK_RETRY_WAIT]`, in 10ms steps.
#[must_use]
pub fn random_retry_wait() -> Duration {
    Duration::from_millis(fastrand::u64(0..=25) * 10)
}

/// Key/value operations with optional transaction staging.
///
/// Every mutating call and every assert takes an optional transaction: with
/// `Some`, the operation is only recorded and becomes visible when the
/// transaction is applied; with `None`, it executes immediately.
#[async_trait]
pub trait KeyValueClient: Clone + Send + Sync + 'static {
    /// Identifier of the cluster behind this client.
    fn cluster_id(&self) -> &str;

    /// Number of keys requested per range read.
    fn batch_size(&self) -> usize;

    /// Reads a value with the given consistency.
    async fn get_with_consistency(&self, key: &str, consistency: Consistency) -> Result<Bytes, Error>;

    /// Reads a value from the master.
    async fn get(&self, key: &str) -> Result<Bytes, Error> {
        self.get_with_consistency(key, Consistency::Consistent).await
    }

    /// Reads several values at once, preserving order.
    ///
    /// With `must_exist`, any absent key fails the whole call with `NotFound`.
    async fn multi_get(&self, keys: &[String], must_exist: bool) -> Result<Vec<Option<Bytes>>, Error>;

    /// Stores a value.
    async fn set(&self, key: &str, value: Bytes, transaction: Option<TransactionId>) -> Result<(), Error>;

    /// Removes a key; without `must_exist`, an absent key is not an error.
    async fn delete(&self, key: &str, must_exist: bool, transaction: Option<TransactionId>) -> Result<(), Error>;

    /// Removes every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str, transaction: Option<TransactionId>) -> Result<(), Error>;

    /// Reads one batch of keys.
    async fn range(&self, request: RangeRequest) -> Result<Vec<String>, Error>;

    /// Reads one batch of key/value pairs.
    async fn range_entries(&self, request: RangeRequest) -> Result<Vec<(String, Bytes)>, Error>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, Error>;

    /// Liveness probe; succeeds once the cluster has a master.
    async fn nop(&self) -> Result<(), Error>;

    /// Name of the current master.
    async fn who_is_master(&self) -> Result<Option<String>, Error>;

    /// Requires the current value to equal `value`, or the key to be absent for `None`.
    async fn assert_value(
        &self,
        key: &str,
        value: Option<Bytes>,
        transaction: Option<TransactionId>,
    ) -> Result<(), Error>;

    /// Requires the key to exist.
    async fn assert_exists(&self, key: &str, transaction: Option<TransactionId>) -> Result<(), Error>;

    /// Requires the keys under `prefix` to be exactly `keys`.
    async fn assert_range(
        &self,
        prefix: &str,
        keys: Vec<String>,
        transaction: Option<TransactionId>,
    ) -> Result<(), Error>;

    /// Starts staging a transaction.
    fn begin_transaction(&self) -> TransactionId;

    /// Applies a staged transaction atomically and discards it, whatever the outcome.
    async fn apply_transaction(&self, transaction: TransactionId) -> Result<(), Error>;

    /// Discards a staged transaction without applying it.
    fn delete_transaction(&self, transaction: TransactionId);

    /// Streams values for `keys` from a single multi-get.
    fn get_multi(&self, keys: Vec<String>, must_exist: bool) -> ValueStream<'_> {
        Box::pin(try_stream! {
            for value in self.multi_get(&keys, must_exist).await? {
                yield value;
            }
        })
    }

    /// Streams every key starting with `prefix`, one range batch at a time.
    fn prefix(&self, prefix: &str) -> KeyStream<'_> {
        let mut request = prefix_request(prefix, self.batch_size());
        Box::pin(try_stream! {
            loop {
                let batch = self.range(request.clone()).await?;
                let Some(last) = batch.last() else {
                    break;
                };
                request.begin = last.as_bytes().to_vec();
                request.begin_inclusive = false;
                for key in batch {
                    yield key;
                }
            }
        })
    }

    /// Streams every key/value pair whose key starts with `prefix`.
    fn prefix_entries(&self, prefix: &str) -> EntryStream<'_> {
        let mut request = prefix_request(prefix, self.batch_size());
        Box::pin(try_stream! {
            loop {
                let batch = self.range_entries(request.clone()).await?;
                let Some((last, _)) = batch.last() else {
                    break;
                };
                request.begin = last.as_bytes().to_vec();
                request.begin_inclusive = false;
                for entry in batch {
                    yield entry;
                }
            }
        })
    }

    /// Builds a transaction with `callback` and applies it, rebuilding it on
    /// assertion conflicts up to `max_retries` times with a short random wait.
    async fn apply_callback_transaction<F, Fut>(&self, callback: F, max_retries: usize) -> Result<(), Error>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<TransactionId, Error>> + Send,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            let transaction = callback().await?;
            match Attempt::classify(self.apply_transaction(transaction).await)? {
                Attempt::Done(()) => return Ok(()),
                Attempt::Conflict(error) => {
                    warn!(
                        cluster = %self.cluster_id(),
                        retries_left = max_retries.saturating_sub(tries),
                        "assertion failed, rebuilding transaction"
                    );
                    if tries > max_retries {
                        return Err(error);
                    }
                    tokio::time::sleep(random_retry_wait()).await;
                }
            }
        }
    }
}

fn prefix_request(prefix: &str, batch_size: usize) -> RangeRequest {
    let begin = prefix.as_bytes().to_vec();
    // No successor means the scan runs to the end of the keyspace.
    let end = next_prefix(&begin).ok();

    RangeRequest {
        begin,
        begin_inclusive: true,
        end,
        end_inclusive: false,
        max_elements: batch_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovs_arakoon::Error as ArakoonError;

    #[test]
    fn test_prefix_request_bounds() {
        let request = prefix_request("ovs", 500);

        assert_eq!(request.end.as_deref(), Some(&b"ovt"[..]));
        assert!(request.begin_inclusive);
        assert!(!request.end_inclusive);
        assert_eq!(request.max_elements, 500);
    }

    #[test]
    fn test_empty_prefix_is_unbounded() {
        assert_eq!(prefix_request("", 10).end, None);
    }

    #[test]
    fn test_random_retry_wait_range() {
        for _ in 0..100 {
            assert!(random_retry_wait() <= MAX_CALLBACK_RETRY_WAIT);
        }
    }

    #[test]
    fn test_attempt_classification() {
        let conflict: Result<(), Error> =
            Err(ArakoonError::AssertionFailed("k".to_string()).into());
        assert!(matches!(Attempt::classify(conflict), Ok(Attempt::Conflict(_))));

        let missing: Result<(), Error> = Err(ArakoonError::NotFound("k".to_string()).into());
        assert!(Attempt::classify(missing).is_err());

        assert!(matches!(Attempt::classify(Ok(1)), Ok(Attempt::Done(1))));
    }
}
