use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ovs_arakoon::{Consistency, Driver, Operation, RangeRequest};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, trace};

use crate::client::{ArakoonClient, ClientConfig, DEFAULT_BATCH_SIZE};
use crate::transactions::Transactions;
use crate::{Error, KeyValueClient, TransactionId};

/// Default number of clients in a pool.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Pool configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of clients, [`DEFAULT_POOL_SIZE`] when unset.
    pub size: Option<usize>,

    /// Configuration shared by every pooled client.
    pub client: ClientConfig,
}

impl PoolConfig {
    /// Default-sized pool for `cluster_id`.
    #[must_use]
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            size: None,
            client: ClientConfig::new(cluster_id),
        }
    }
}

struct PoolInner<D: Driver> {
    cluster_id: String,
    batch_size: usize,
    clients: Mutex<VecDeque<ArakoonClient<D>>>,
    semaphore: Semaphore,
    transactions: Transactions,
}

/// Fixed set of clients to one cluster, shared by concurrent callers.
///
/// Each call checks a client out for its duration, so at most `size` calls run
/// at once and the rest wait for a client to come back. Transactions are
/// staged in the pool and applied through whichever client is free.
pub struct ArakoonPool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for ArakoonPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> Debug for ArakoonPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArakoonPool")
            .field("cluster_id", &self.inner.cluster_id)
            .field("available", &self.inner.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}

struct PooledClient<'a, D: Driver> {
    client: ArakoonClient<D>,
    pool: &'a PoolInner<D>,
    _permit: SemaphorePermit<'a>,
}

impl<D: Driver> Deref for PooledClient<'_, D> {
    type Target = ArakoonClient<D>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl<D: Driver> Drop for PooledClient<'_, D> {
    fn drop(&mut self) {
        trace!(client = self.client.identifier(), "returning client to pool");
        self.pool.clients.lock().push_back(self.client.clone());
    }
}

impl<D: Driver> ArakoonPool<D> {
    /// Builds the pool, creating one driver per client with `connect`.
    pub fn new(config: PoolConfig, connect: impl Fn() -> D) -> Self {
        let size = config.size.unwrap_or(DEFAULT_POOL_SIZE).max(1);
        let clients: VecDeque<_> = (0..size)
            .map(|_| ArakoonClient::new(config.client.clone(), connect()))
            .collect();
        debug!(cluster = %config.client.cluster_id, size, "created client pool");

        Self {
            inner: Arc::new(PoolInner {
                cluster_id: config.client.cluster_id.clone(),
                batch_size: config.client.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
                clients: Mutex::new(clients),
                semaphore: Semaphore::new(size),
                transactions: Transactions::default(),
            }),
        }
    }

    /// Clients currently not checked out.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    async fn checkout(&self) -> Result<PooledClient<'_, D>, Error> {
        let permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::PoolUnavailable)?;
        let client = self
            .inner
            .clients
            .lock()
            .pop_front()
            .ok_or(Error::PoolUnavailable)?;

        Ok(PooledClient {
            client,
            pool: &self.inner,
            _permit: permit,
        })
    }

    fn stage(&self, transaction: TransactionId, operation: Operation) -> Result<(), Error> {
        self.inner.transactions.stage(transaction, operation)
    }
}

#[async_trait]
impl<D: Driver> KeyValueClient for ArakoonPool<D> {
    fn cluster_id(&self) -> &str {
        &self.inner.cluster_id
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    async fn get_with_consistency(&self, key: &str, consistency: Consistency) -> Result<Bytes, Error> {
        self.checkout().await?.get_with_consistency(key, consistency).await
    }

    async fn multi_get(&self, keys: &[String], must_exist: bool) -> Result<Vec<Option<Bytes>>, Error> {
        self.checkout().await?.multi_get(keys, must_exist).await
    }

    async fn set(&self, key: &str, value: Bytes, transaction: Option<TransactionId>) -> Result<(), Error> {
        match transaction {
            Some(transaction) => self.stage(
                transaction,
                Operation::Set {
                    key: key.to_string(),
                    value,
                },
            ),
            None => self.checkout().await?.set(key, value, None).await,
        }
    }

    async fn delete(&self, key: &str, must_exist: bool, transaction: Option<TransactionId>) -> Result<(), Error> {
        match transaction {
            Some(transaction) if must_exist => {
                self.stage(transaction, Operation::Delete { key: key.to_string() })
            }
            Some(transaction) => self.stage(
                transaction,
                Operation::Replace {
                    key: key.to_string(),
                    value: None,
                },
            ),
            None => self.checkout().await?.delete(key, must_exist, None).await,
        }
    }

    async fn delete_prefix(&self, prefix: &str, transaction: Option<TransactionId>) -> Result<(), Error> {
        match transaction {
            Some(transaction) => self.stage(
                transaction,
                Operation::DeletePrefix {
                    prefix: prefix.to_string(),
                },
            ),
            None => self.checkout().await?.delete_prefix(prefix, None).await,
        }
    }

    async fn range(&self, request: RangeRequest) -> Result<Vec<String>, Error> {
        self.checkout().await?.range(request).await
    }

    async fn range_entries(&self, request: RangeRequest) -> Result<Vec<(String, Bytes)>, Error> {
        self.checkout().await?.range_entries(request).await
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        self.checkout().await?.exists(key).await
    }

    async fn nop(&self) -> Result<(), Error> {
        self.checkout().await?.nop().await
    }

    async fn who_is_master(&self) -> Result<Option<String>, Error> {
        self.checkout().await?.who_is_master().await
    }

    async fn assert_value(
        &self,
        key: &str,
        value: Option<Bytes>,
        transaction: Option<TransactionId>,
    ) -> Result<(), Error> {
        match transaction {
            Some(transaction) => self.stage(
                transaction,
                Operation::Assert {
                    key: key.to_string(),
                    value,
                },
            ),
            None => self.checkout().await?.assert_value(key, value, None).await,
        }
    }

    async fn assert_exists(&self, key: &str, transaction: Option<TransactionId>) -> Result<(), Error> {
        match transaction {
            Some(transaction) => {
                self.stage(transaction, Operation::AssertExists { key: key.to_string() })
            }
            None => self.checkout().await?.assert_exists(key, None).await,
        }
    }

    async fn assert_range(
        &self,
        prefix: &str,
        keys: Vec<String>,
        transaction: Option<TransactionId>,
    ) -> Result<(), Error> {
        match transaction {
            Some(transaction) => self.stage(
                transaction,
                Operation::AssertRange {
                    prefix: prefix.to_string(),
                    keys,
                },
            ),
            None => self.checkout().await?.assert_range(prefix, keys, None).await,
        }
    }

    fn begin_transaction(&self) -> TransactionId {
        self.inner.transactions.begin()
    }

    async fn apply_transaction(&self, transaction: TransactionId) -> Result<(), Error> {
        let operations = self.inner.transactions.take(transaction)?;
        self.checkout().await?.sequence(operations).await
    }

    fn delete_transaction(&self, transaction: TransactionId) {
        self.inner.transactions.discard(transaction);
    }
}
