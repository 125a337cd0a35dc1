use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ovs_arakoon::{Consistency, Driver, Error as ArakoonError, Operation, RangeRequest};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::transactions::Transactions;
use crate::{Error, KeyValueClient, TransactionId};

/// Default number of keys fetched per range batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Calls slower than this are logged.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_millis(500);

/// Applying a transaction slower than this is logged.
pub const DEFAULT_TRANSACTION_MAX_DURATION: Duration = Duration::from_secs(1);

/// Wait before the single retry of a transient socket error.
pub const DEFAULT_SOCKET_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Attempts made while the cluster has no reachable master.
pub const DEFAULT_MASTER_RETRIES: u32 = 10;

/// First back-off interval while waiting for a master.
pub const DEFAULT_MASTER_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Growth factor of the master back-off interval.
pub const DEFAULT_MASTER_RETRY_MULTIPLIER: u32 = 2;

/// Client configuration. Unset fields fall back to the `DEFAULT_*` constants.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Cluster to talk to.
    pub cluster_id: String,

    /// Keys fetched per range batch.
    pub batch_size: Option<usize>,

    /// Slow-call warning threshold.
    pub max_duration: Option<Duration>,

    /// Slow-call warning threshold for applying transactions.
    pub transaction_max_duration: Option<Duration>,

    /// Delay before retrying a transient socket error.
    pub socket_retry_delay: Option<Duration>,

    /// Maximum attempts while no master is available.
    pub master_retries: Option<u32>,

    /// Initial back-off while no master is available.
    pub master_retry_interval: Option<Duration>,

    /// Back-off multiplier while no master is available.
    pub master_retry_multiplier: Option<u32>,
}

impl ClientConfig {
    /// Configuration with all defaults for `cluster_id`.
    #[must_use]
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            batch_size: None,
            max_duration: None,
            transaction_max_duration: None,
            socket_retry_delay: None,
            master_retries: None,
            master_retry_interval: None,
            master_retry_multiplier: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

struct Settings {
    batch_size: usize,
    max_duration: Duration,
    transaction_max_duration: Duration,
    socket_retry_delay: Duration,
    master_retries: u32,
    master_retry_interval: Duration,
    master_retry_multiplier: u32,
}

struct ClientInner<D> {
    cluster_id: String,
    identifier: u32,
    driver: D,
    // Held across a whole retry cycle so calls on one client never interleave.
    lock: Mutex<()>,
    transactions: Transactions,
    settings: Settings,
}

/// Arakoon client that hides transient failures behind a retry policy.
///
/// Transient socket errors are retried once after dropping connections.
/// Lost or changing masters are retried with exponential back-off; socket and
/// shutdown errors get the same treatment for read-only calls. Missing keys
/// and failed asserts are returned immediately.
pub struct ArakoonClient<D: Driver> {
    inner: Arc<ClientInner<D>>,
}

impl<D: Driver> Clone for ArakoonClient<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> Debug for ArakoonClient<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArakoonClient")
            .field("cluster_id", &self.inner.cluster_id)
            .field("identifier", &self.inner.identifier)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> ArakoonClient<D> {
    /// Wraps `driver` with the retry policy from `config`.
    pub fn new(config: ClientConfig, driver: D) -> Self {
        let settings = Settings {
            batch_size: config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            max_duration: config.max_duration.unwrap_or(DEFAULT_MAX_DURATION),
            transaction_max_duration: config
                .transaction_max_duration
                .unwrap_or(DEFAULT_TRANSACTION_MAX_DURATION),
            socket_retry_delay: config
                .socket_retry_delay
                .unwrap_or(DEFAULT_SOCKET_RETRY_DELAY),
            master_retries: config.master_retries.unwrap_or(DEFAULT_MASTER_RETRIES),
            master_retry_interval: config
                .master_retry_interval
                .unwrap_or(DEFAULT_MASTER_RETRY_INTERVAL),
            master_retry_multiplier: config
                .master_retry_multiplier
                .unwrap_or(DEFAULT_MASTER_RETRY_MULTIPLIER),
        };

        Self {
            inner: Arc::new(ClientInner {
                cluster_id: config.cluster_id,
                identifier: fastrand::u32(..10_000_000),
                driver,
                lock: Mutex::new(()),
                transactions: Transactions::default(),
                settings,
            }),
        }
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Random identifier used to tell clients apart in logs.
    pub fn identifier(&self) -> u32 {
        self.inner.identifier
    }

    /// Applies `operations` atomically as one sequence.
    ///
    /// # Errors
    ///
    /// Fails with the first operation that does not hold; nothing is applied then.
    pub async fn sequence(&self, operations: Vec<Operation>) -> Result<(), Error> {
        debug!(
            cluster = %self.inner.cluster_id,
            client = self.inner.identifier,
            operations = operations.len(),
            "applying sequence"
        );
        self.call(
            "sequence",
            Access::Write,
            self.inner.settings.transaction_max_duration,
            || self.inner.driver.sequence(&operations),
        )
        .await
    }

    async fn call<T, F, Fut>(
        &self,
        name: &'static str,
        access: Access,
        max_duration: Duration,
        operation: F,
    ) -> Result<T, Error>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, ArakoonError>> + Send,
    {
        let settings = &self.inner.settings;
        let _guard = self.inner.lock.lock().await;
        let started = Instant::now();
        let mut socket_retried = false;
        let mut master_attempts = 0u32;

        let result = loop {
            match operation().await {
                Ok(value) => break Ok(value),
                Err(error) if error.is_transient_socket() => {
                    if socket_retried {
                        break Err(Error::Transport {
                            call: name,
                            source: error,
                        });
                    }
                    socket_retried = true;
                    warn!(
                        cluster = %self.inner.cluster_id,
                        client = self.inner.identifier,
                        call = name,
                        error = %error,
                        "transient socket error, retrying once"
                    );
                    self.inner.driver.drop_connections().await;
                    sleep(settings.socket_retry_delay).await;
                }
                Err(error)
                    if error.is_master_loss()
                        || (access == Access::Read && error.is_read_retriable()) =>
                {
                    master_attempts += 1;
                    if master_attempts >= settings.master_retries {
                        break Err(error.into());
                    }
                    let backoff = settings.master_retry_interval.saturating_mul(
                        settings
                            .master_retry_multiplier
                            .saturating_pow(master_attempts - 1),
                    );
                    warn!(
                        cluster = %self.inner.cluster_id,
                        client = self.inner.identifier,
                        call = name,
                        error = %error,
                        attempt = master_attempts,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "master unavailable, backing off"
                    );
                    self.inner.driver.drop_connections().await;
                    sleep(backoff).await;
                }
                Err(error) => break Err(error.into()),
            }
        };

        let elapsed = started.elapsed();
        if elapsed > max_duration {
            warn!(
                cluster = %self.inner.cluster_id,
                client = self.inner.identifier,
                call = name,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "slow arakoon call"
            );
        }

        result
    }

    fn stage(&self, transaction: TransactionId, operation: Operation) -> Result<(), Error> {
        self.inner.transactions.stage(transaction, operation)
    }

    #[cfg(test)]
    pub(crate) fn staged_transactions(&self) -> usize {
        self.inner.transactions.len()
    }
}

#[async_trait]
impl<D: Driver> KeyValueClient for ArakoonClient<D> {
    fn cluster_id(&self) -> &str {
        &self.inner.cluster_id
    }

    fn batch_size(&self) -> usize {
        self.inner.settings.batch_size
    }

    async fn get_with_consistency(&self, key: &str, consistency: Consistency) -> Result<Bytes, Error> {
        self.call("get", Access::Read, self.inner.settings.max_duration, || {
            self.inner.driver.get(key, consistency)
        })
        .await
    }

    async fn multi_get(&self, keys: &[String], must_exist: bool) -> Result<Vec<Option<Bytes>>, Error> {
        let max_duration = self.inner.settings.max_duration;
        if must_exist {
            let values = self
                .call("multi_get", Access::Read, max_duration, || {
                    self.inner.driver.multi_get(keys)
                })
                .await?;
            return Ok(values.into_iter().map(Some).collect());
        }

        self.call("multi_get_option", Access::Read, max_duration, || {
            self.inner.driver.multi_get_option(keys)
        })
        .await
    }

    async fn set(&self, key: &str, value: Bytes, transaction: Option<TransactionId>) -> Result<(), Error> {
        if let Some(transaction) = transaction {
            return self.stage(
                transaction,
                Operation::Set {
                    key: key.to_string(),
                    value,
                },
            );
        }

        self.call("set", Access::Write, self.inner.settings.max_duration, || {
            self.inner.driver.set(key, value.clone())
        })
        .await
    }

    async fn delete(&self, key: &str, must_exist: bool, transaction: Option<TransactionId>) -> Result<(), Error> {
        if let Some(transaction) = transaction {
            let operation = if must_exist {
                Operation::Delete { key: key.to_string() }
            } else {
                Operation::Replace {
                    key: key.to_string(),
                    value: None,
                }
            };
            return self.stage(transaction, operation);
        }

        let max_duration = self.inner.settings.max_duration;
        if must_exist {
            self.call("delete", Access::Write, max_duration, || {
                self.inner.driver.delete(key)
            })
            .await
        } else {
            self.call("replace", Access::Write, max_duration, || {
                self.inner.driver.replace(key, None)
            })
            .await
            .map(|_| ())
        }
    }

    async fn delete_prefix(&self, prefix: &str, transaction: Option<TransactionId>) -> Result<(), Error> {
        if let Some(transaction) = transaction {
            return self.stage(
                transaction,
                Operation::DeletePrefix {
                    prefix: prefix.to_string(),
                },
            );
        }

        let removed = self
            .call("delete_prefix", Access::Write, self.inner.settings.max_duration, || {
                self.inner.driver.delete_prefix(prefix)
            })
            .await?;
        debug!(cluster = %self.inner.cluster_id, prefix, removed, "deleted prefix");
        Ok(())
    }

    async fn range(&self, request: RangeRequest) -> Result<Vec<String>, Error> {
        self.call("range", Access::Read, self.inner.settings.max_duration, || {
            self.inner.driver.range(&request)
        })
        .await
    }

    async fn range_entries(&self, request: RangeRequest) -> Result<Vec<(String, Bytes)>, Error> {
        self.call("range_entries", Access::Read, self.inner.settings.max_duration, || {
            self.inner.driver.range_entries(&request)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        self.call("exists", Access::Read, self.inner.settings.max_duration, || {
            self.inner.driver.exists(key)
        })
        .await
    }

    async fn nop(&self) -> Result<(), Error> {
        self.call("nop", Access::Read, self.inner.settings.max_duration, || {
            self.inner.driver.nop()
        })
        .await
    }

    async fn who_is_master(&self) -> Result<Option<String>, Error> {
        self.call("who_is_master", Access::Read, self.inner.settings.max_duration, || {
            self.inner.driver.who_is_master()
        })
        .await
    }

    async fn assert_value(
        &self,
        key: &str,
        value: Option<Bytes>,
        transaction: Option<TransactionId>,
    ) -> Result<(), Error> {
        if let Some(transaction) = transaction {
            return self.stage(
                transaction,
                Operation::Assert {
                    key: key.to_string(),
                    value,
                },
            );
        }

        self.call("assert", Access::Read, self.inner.settings.max_duration, || {
            self.inner.driver.assert(key, value.clone())
        })
        .await
    }

    async fn assert_exists(&self, key: &str, transaction: Option<TransactionId>) -> Result<(), Error> {
        if let Some(transaction) = transaction {
            return self.stage(transaction, Operation::AssertExists { key: key.to_string() });
        }

        self.call("assert_exists", Access::Read, self.inner.settings.max_duration, || {
            self.inner.driver.assert_exists(key)
        })
        .await
    }

    async fn assert_range(
        &self,
        prefix: &str,
        keys: Vec<String>,
        transaction: Option<TransactionId>,
    ) -> Result<(), Error> {
        let operation = Operation::AssertRange {
            prefix: prefix.to_string(),
            keys,
        };
        match transaction {
            Some(transaction) => self.stage(transaction, operation),
            None => self.sequence(vec![operation]).await,
        }
    }

    fn begin_transaction(&self) -> TransactionId {
        self.inner.transactions.begin()
    }

    async fn apply_transaction(&self, transaction: TransactionId) -> Result<(), Error> {
        let operations = self.inner.transactions.take(transaction)?;
        self.sequence(operations).await
    }

    fn delete_transaction(&self, transaction: TransactionId) {
        self.inner.transactions.discard(transaction);
    }
}
