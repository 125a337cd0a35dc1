use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use bytes::Bytes;
use ovs_arakoon::ClusterEndpoints;
use ovs_arakoon_client::{Attempt, KeyValueClient, TransactionId, random_retry_wait};
use ovs_locks_arakoon::{ArakoonLock, LockConfig};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::Error;

/// Default attempts for [`ArakoonConfiguration::rename`].
pub const DEFAULT_RENAME_RETRIES: usize = 20;

/// Lazily listed keys.
pub type ListStream<'a> = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send + 'a>>;

/// Strips the leading slashes; keys are stored without them.
#[must_use]
pub fn clean_key(key: &str) -> &str {
    key.trim_start_matches('/')
}

/// Directory-like view over the flat key space of an Arakoon cluster.
///
/// Directories are not stored: a key `a/b/c` implies directories `a` and
/// `a/b`. Every operation goes through the wrapped [`KeyValueClient`].
#[derive(Clone, Debug)]
pub struct ArakoonConfiguration<C: KeyValueClient> {
    client: C,
    cluster_id: String,
    cacc_location: Option<PathBuf>,
    lock_config: LockConfig,
}

impl<C: KeyValueClient> ArakoonConfiguration<C> {
    /// Wraps `client`.
    pub fn new(client: C) -> Self {
        Self {
            cluster_id: client.cluster_id().to_string(),
            client,
            cacc_location: None,
            lock_config: LockConfig::default(),
        }
    }

    /// Builds the façade from a client configuration (cacc) file, using
    /// `connect` to turn the endpoints it lists into a client.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or lacks the cluster id or node sections.
    pub async fn from_cacc<F>(path: impl AsRef<Path>, connect: F) -> Result<Self, Error>
    where
        F: FnOnce(ClusterEndpoints) -> C,
    {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| Error::Cacc {
                path: path.to_path_buf(),
                source,
            })?;
        let endpoints = ClusterEndpoints::from_ini(&contents)?;
        debug!(cluster = %endpoints.cluster_id, path = %path.display(), "loaded client configuration");

        let mut configuration = Self::new(connect(endpoints));
        configuration.cacc_location = Some(path.to_path_buf());
        Ok(configuration)
    }

    /// Sets the defaults for locks created through [`ArakoonConfiguration::lock`].
    #[must_use]
    pub fn with_lock_config(mut self, lock_config: LockConfig) -> Self {
        self.lock_config = lock_config;
        self
    }

    /// The underlying client.
    pub const fn client(&self) -> &C {
        &self.client
    }

    /// Identifier of the cluster holding the configuration.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Locator for `key` usable by tools outside this process, for example
    /// `arakoon://config/ovs/framework?ini=%2Fopt%2Fconfig.ini`.
    pub fn get_configuration_path(&self, key: &str) -> String {
        let mut path = format!("arakoon://{}/{}", self.cluster_id, clean_key(key));
        if let Some(location) = &self.cacc_location {
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair("ini", &location.to_string_lossy())
                .finish();
            path.push('?');
            path.push_str(&query);
        }
        path
    }

    /// Whether `key` is a directory: some stored key lives below it and
    /// `key` itself is not a stored key.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read.
    pub async fn dir_exists(&self, key: &str) -> Result<bool, Error> {
        let key = clean_key(key).trim_end_matches('/');
        let below = if key.is_empty() {
            String::new()
        } else {
            if self.client.exists(key).await? {
                return Ok(false);
            }
            format!("{key}/")
        };

        Ok(self.client.prefix(&below).next().await.transpose()?.is_some())
    }

    /// Lists what lives under `key`.
    ///
    /// Without `recursive`, yields each distinct first path segment below
    /// `key`. With `recursive`, yields every directory (with a trailing `/`)
    /// the first time it is seen, followed by each full key. Keys starting
    /// with `_` are internal and skipped.
    pub fn list(&self, key: &str, recursive: bool) -> ListStream<'_> {
        let key = clean_key(key).to_string();
        Box::pin(try_stream! {
            let mut seen = HashSet::new();
            let directory = format!("{}/", key.trim_end_matches('/'));
            let mut entries = self.client.prefix(&key);

            while let Some(entry) = entries.next().await {
                let entry = entry?;
                if entry.starts_with('_') {
                    continue;
                }

                if recursive {
                    let mut end = 0;
                    while let Some(offset) = entry[end..].find('/') {
                        end += offset + 1;
                        let parent = &entry[..end];
                        if seen.insert(parent.to_string()) {
                            yield parent.to_string();
                        }
                    }
                    yield entry;
                } else if key.is_empty() || entry.starts_with(&directory) {
                    let child = entry
                        .strip_prefix(key.as_str())
                        .unwrap_or(entry.as_str())
                        .trim_matches('/')
                        .split('/')
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    if seen.insert(child.clone()) {
                        yield child;
                    }
                }
            }
        })
    }

    /// Deletes `key`, or everything below it when `recursive`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::RecursiveDeleteInTransaction`] for a recursive
    /// delete inside a transaction, and with [`Error::NotFound`] when a
    /// single key is absent.
    pub async fn delete(&self, key: &str, recursive: bool, transaction: Option<TransactionId>) -> Result<(), Error> {
        let key = clean_key(key);
        if recursive {
            if transaction.is_some() {
                return Err(Error::RecursiveDeleteInTransaction(key.to_string()));
            }
            self.client.delete_prefix(key, None).await?;
            return Ok(());
        }

        self.client
            .delete(key, true, transaction)
            .await
            .map_err(|error| not_found(error, key))
    }

    /// Reads the value of `key`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] when absent.
    pub async fn get(&self, key: &str) -> Result<Bytes, Error> {
        let key = clean_key(key);
        self.client.get(key).await.map_err(|error| not_found(error, key))
    }

    /// Stores `value` under `key`, or stages it in `transaction`.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the write.
    pub async fn set(&self, key: &str, value: Bytes, transaction: Option<TransactionId>) -> Result<(), Error> {
        Ok(self.client.set(clean_key(key), value, transaction).await?)
    }

    /// Whether `key` is a stored key.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read.
    pub async fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(self.client.exists(clean_key(key)).await?)
    }

    /// Moves `key` and everything below it to `new_key` in one transaction.
    ///
    /// Each moved value is asserted unchanged, so a concurrent writer makes
    /// the attempt fail; the move is then rebuilt and retried after a short
    /// random wait, up to `max_retries` attempts.
    ///
    /// # Errors
    ///
    /// Returns the last assertion failure once all attempts are used up.
    pub async fn rename(&self, key: &str, new_key: &str, max_retries: usize) -> Result<(), Error> {
        let key = clean_key(key);
        let new_key = clean_key(new_key);
        let attempts = max_retries.max(1);

        for attempt in 1..=attempts {
            let moves = self.collect_moves(key, new_key).await?;
            let transaction = self.client.begin_transaction();
            for (old, new, value) in &moves {
                self.client
                    .assert_value(old, Some(value.clone()), Some(transaction))
                    .await?;
                self.client.set(new, value.clone(), Some(transaction)).await?;
                self.client.delete(old, true, Some(transaction)).await?;
            }

            match Attempt::classify(self.client.apply_transaction(transaction).await)? {
                Attempt::Done(()) => {
                    debug!(from = %key, to = %new_key, moved = moves.len(), "renamed");
                    return Ok(());
                }
                Attempt::Conflict(error) if attempt == attempts => {
                    warn!(from = %key, to = %new_key, attempts, "rename kept conflicting, giving up");
                    return Err(error.into());
                }
                Attempt::Conflict(_) => {
                    debug!(from = %key, to = %new_key, attempt, "rename conflicted, retrying");
                    tokio::time::sleep(random_retry_wait()).await;
                }
            }
        }

        Ok(())
    }

    async fn collect_moves(&self, key: &str, new_key: &str) -> Result<Vec<(String, String, Bytes)>, Error> {
        let mut moves = Vec::new();
        let mut entries = self.client.prefix_entries(key);

        while let Some(entry) = entries.next().await {
            let (entry, value) = entry?;
            let target = if entry == key {
                new_key.to_string()
            } else {
                match entry.strip_prefix(key) {
                    Some(suffix) if suffix.starts_with('/') => format!(
                        "{}/{}",
                        new_key.trim_end_matches('/'),
                        suffix.trim_start_matches('/')
                    ),
                    // A sibling sharing the prefix, such as `foobar` for `foo`.
                    _ => continue,
                }
            };
            moves.push((entry, target, value));
        }

        Ok(moves)
    }

    /// Requires `key` to hold `value`, or to be absent for `None`.
    ///
    /// # Errors
    ///
    /// Fails with an assertion failure when the precondition does not hold.
    pub async fn assert_value(
        &self,
        key: &str,
        value: Option<Bytes>,
        transaction: Option<TransactionId>,
    ) -> Result<(), Error> {
        Ok(self.client.assert_value(clean_key(key), value, transaction).await?)
    }

    /// Requires `key` to exist.
    ///
    /// # Errors
    ///
    /// Fails with an assertion failure when the key is absent.
    pub async fn assert_exists(&self, key: &str, transaction: Option<TransactionId>) -> Result<(), Error> {
        Ok(self.client.assert_exists(clean_key(key), transaction).await?)
    }

    /// Starts staging a transaction.
    pub fn begin_transaction(&self) -> TransactionId {
        self.client.begin_transaction()
    }

    /// Applies a staged transaction.
    ///
    /// # Errors
    ///
    /// Fails with an assertion failure, applying nothing, if any staged assert does not hold.
    pub async fn apply_transaction(&self, transaction: TransactionId) -> Result<(), Error> {
        Ok(self.client.apply_transaction(transaction).await?)
    }

    /// A lease lock called `name`, stored in the same cluster.
    pub fn lock(&self, name: &str, wait: Option<Duration>, expiration: Option<Duration>) -> ArakoonLock<C> {
        let config = LockConfig {
            wait,
            expiration: expiration.or(self.lock_config.expiration),
            ..self.lock_config.clone()
        };
        ArakoonLock::new(self.client.clone(), name, config)
    }
}

fn not_found(error: ovs_arakoon_client::Error, key: &str) -> Error {
    if error.is_not_found() {
        Error::NotFound(key.to_string())
    } else {
        error.into()
    }
}
