//! In-memory Arakoon driver for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ovs_arakoon::{Consistency, Driver, Error, Operation, RangeRequest};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

const DEFAULT_MASTER: &str = "memory_0";

#[derive(Default)]
struct ClusterState {
    store: BTreeMap<Vec<u8>, Bytes>,
    faults: VecDeque<Error>,
    interleaved: VecDeque<(String, Bytes)>,
    master: Option<String>,
    calls: u64,
    dropped_connections: u64,
}

/// Driver backed by a process-local ordered map.
///
/// Clones share the same cluster state, so several clients built from clones
/// of one driver see each other's writes. Failures can be injected with
/// [`MemoryDriver::fail_next`] to exercise retry paths.
#[derive(Clone)]
pub struct MemoryDriver {
    cluster_id: String,
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryDriver {
    /// Creates an empty cluster with an elected master.
    #[must_use]
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            state: Arc::new(Mutex::new(ClusterState {
                master: Some(DEFAULT_MASTER.to_string()),
                ..ClusterState::default()
            })),
        }
    }

    /// Identifier of the simulated cluster.
    #[must_use]
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Makes the next call fail with `error`. Queued errors are consumed one per call.
    pub fn fail_next(&self, error: Error) {
        self.state.lock().faults.push_back(error);
    }

    /// Simulates a concurrent writer: the next `sequence` call first stores
    /// `value` under `key`, then applies its own operations.
    pub fn write_before_next_sequence(&self, key: impl Into<String>, value: Bytes) {
        self.state.lock().interleaved.push_back((key.into(), value));
    }

    /// Changes the elected master; `None` makes every call fail with [`Error::NoMaster`].
    pub fn set_master(&self, master: Option<String>) {
        self.state.lock().master = master;
    }

    /// Number of driver calls made so far, failed ones included.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.state.lock().calls
    }

    /// Number of times connections were dropped.
    #[must_use]
    pub fn dropped_connections(&self) -> u64 {
        self.state.lock().dropped_connections
    }

    /// Copy of the stored data.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Bytes> {
        self.state
            .lock()
            .store
            .iter()
            .map(|(key, value)| (String::from_utf8_lossy(key).into_owned(), value.clone()))
            .collect()
    }

    fn begin_call(&self) -> Result<MutexGuard<'_, ClusterState>, Error> {
        let mut state = self.state.lock();
        state.calls += 1;

        if let Some(error) = state.faults.pop_front() {
            debug!(cluster = %self.cluster_id, error = %error, "injected failure");
            return Err(error);
        }
        if state.master.is_none() {
            return Err(Error::NoMaster(self.cluster_id.clone()));
        }

        Ok(state)
    }
}

impl Debug for MemoryDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryDriver")
            .field("cluster_id", &self.cluster_id)
            .field("keys", &state.store.len())
            .field("master", &state.master)
            .finish_non_exhaustive()
    }
}

fn key_string(key: &[u8]) -> Result<String, Error> {
    String::from_utf8(key.to_vec()).map_err(|e| Error::Other(e.to_string()))
}

fn prefixed<'a>(
    store: &'a BTreeMap<Vec<u8>, Bytes>,
    prefix: &'a str,
) -> impl Iterator<Item = &'a Vec<u8>> + 'a {
    store
        .range(prefix.as_bytes().to_vec()..)
        .map(|(key, _)| key)
        .take_while(move |key| key.starts_with(prefix.as_bytes()))
}

fn apply(store: &mut BTreeMap<Vec<u8>, Bytes>, operation: &Operation) -> Result<(), Error> {
    match operation {
        Operation::Set { key, value } => {
            store.insert(key.as_bytes().to_vec(), value.clone());
        }
        Operation::Delete { key } => {
            store
                .remove(key.as_bytes())
                .ok_or_else(|| Error::NotFound(key.clone()))?;
        }
        Operation::Replace { key, value } => match value {
            Some(value) => {
                store.insert(key.as_bytes().to_vec(), value.clone());
            }
            None => {
                store.remove(key.as_bytes());
            }
        },
        Operation::DeletePrefix { prefix } => {
            let doomed: Vec<Vec<u8>> = prefixed(store, prefix).cloned().collect();
            for key in doomed {
                store.remove(&key);
            }
        }
        Operation::Assert { key, value } => {
            if store.get(key.as_bytes()) != value.as_ref() {
                return Err(Error::AssertionFailed(key.clone()));
            }
        }
        Operation::AssertExists { key } => {
            if !store.contains_key(key.as_bytes()) {
                return Err(Error::AssertionFailed(key.clone()));
            }
        }
        Operation::AssertRange { prefix, keys } => {
            let found = prefixed(store, prefix)
                .map(|key| key_string(key))
                .collect::<Result<Vec<_>, _>>()?;
            if &found != keys {
                return Err(Error::AssertionFailed(prefix.clone()));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn get(&self, key: &str, _consistency: Consistency) -> Result<Bytes, Error> {
        self.begin_call()?
            .store
            .get(key.as_bytes())
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Bytes>, Error> {
        let state = self.begin_call()?;
        keys.iter()
            .map(|key| {
                state
                    .store
                    .get(key.as_bytes())
                    .cloned()
                    .ok_or_else(|| Error::NotFound(key.clone()))
            })
            .collect()
    }

    async fn multi_get_option(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, Error> {
        let state = self.begin_call()?;
        Ok(keys
            .iter()
            .map(|key| state.store.get(key.as_bytes()).cloned())
            .collect())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), Error> {
        self.begin_call()?.store.insert(key.as_bytes().to_vec(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut state = self.begin_call()?;
        apply(&mut state.store, &Operation::Delete { key: key.to_string() })
    }

    async fn replace(&self, key: &str, value: Option<Bytes>) -> Result<Option<Bytes>, Error> {
        let mut state = self.begin_call()?;
        let previous = state.store.get(key.as_bytes()).cloned();
        apply(
            &mut state.store,
            &Operation::Replace {
                key: key.to_string(),
                value,
            },
        )?;
        Ok(previous)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, Error> {
        let mut state = self.begin_call()?;
        let before = state.store.len();
        apply(
            &mut state.store,
            &Operation::DeletePrefix {
                prefix: prefix.to_string(),
            },
        )?;
        Ok((before - state.store.len()) as u64)
    }

    async fn range(&self, request: &RangeRequest) -> Result<Vec<String>, Error> {
        let state = self.begin_call()?;
        state
            .store
            .range(request.begin.clone()..)
            .filter(|(key, _)| request.contains(key))
            .take_while(|(key, _)| {
                request
                    .end
                    .as_ref()
                    .is_none_or(|end| key.as_slice() <= end.as_slice())
            })
            .take(request.max_elements)
            .map(|(key, _)| key_string(key))
            .collect()
    }

    async fn range_entries(&self, request: &RangeRequest) -> Result<Vec<(String, Bytes)>, Error> {
        let state = self.begin_call()?;
        state
            .store
            .range(request.begin.clone()..)
            .filter(|(key, _)| request.contains(key))
            .take_while(|(key, _)| {
                request
                    .end
                    .as_ref()
                    .is_none_or(|end| key.as_slice() <= end.as_slice())
            })
            .take(request.max_elements)
            .map(|(key, value)| Ok((key_string(key)?, value.clone())))
            .collect()
    }

    async fn sequence(&self, operations: &[Operation]) -> Result<(), Error> {
        let mut state = self.begin_call()?;
        if let Some((key, value)) = state.interleaved.pop_front() {
            debug!(cluster = %self.cluster_id, key = %key, "interleaved write");
            state.store.insert(key.into_bytes(), value);
        }
        let mut working = state.store.clone();

        for operation in operations {
            apply(&mut working, operation)?;
        }

        state.store = working;
        Ok(())
    }

    async fn nop(&self) -> Result<(), Error> {
        self.begin_call().map(|_| ())
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(self.begin_call()?.store.contains_key(key.as_bytes()))
    }

    async fn assert(&self, key: &str, value: Option<Bytes>) -> Result<(), Error> {
        let mut state = self.begin_call()?;
        apply(
            &mut state.store,
            &Operation::Assert {
                key: key.to_string(),
                value,
            },
        )
    }

    async fn assert_exists(&self, key: &str) -> Result<(), Error> {
        let mut state = self.begin_call()?;
        apply(
            &mut state.store,
            &Operation::AssertExists {
                key: key.to_string(),
            },
        )
    }

    async fn who_is_master(&self) -> Result<Option<String>, Error> {
        Ok(self.begin_call()?.master.clone())
    }

    async fn drop_connections(&self) {
        self.state.lock().dropped_connections += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    fn bytes(value: &str) -> Bytes {
        Bytes::from(value.to_string())
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let driver = MemoryDriver::new("test");

        driver.set("/foo", bytes("1")).await.unwrap();
        assert_eq!(driver.get("/foo", Consistency::default()).await.unwrap(), bytes("1"));

        driver.delete("/foo").await.unwrap();
        assert_matches!(
            driver.get("/foo", Consistency::default()).await,
            Err(Error::NotFound(key)) if key == "/foo"
        );
        assert_matches!(driver.delete("/foo").await, Err(Error::NotFound(_)));
        assert_eq!(driver.replace("/foo", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sequence_is_atomic() {
        let driver = MemoryDriver::new("test");
        driver.set("guard", bytes("old")).await.unwrap();

        let result = driver
            .sequence(&[
                Operation::Set {
                    key: "a".to_string(),
                    value: bytes("1"),
                },
                Operation::Assert {
                    key: "guard".to_string(),
                    value: Some(bytes("new")),
                },
                Operation::Set {
                    key: "b".to_string(),
                    value: bytes("2"),
                },
            ])
            .await;

        assert_matches!(result, Err(Error::AssertionFailed(key)) if key == "guard");
        assert!(!driver.exists("a").await.unwrap());
        assert!(!driver.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_sequence_sees_earlier_steps() {
        let driver = MemoryDriver::new("test");

        driver
            .sequence(&[
                Operation::Assert {
                    key: "lock".to_string(),
                    value: None,
                },
                Operation::Set {
                    key: "lock".to_string(),
                    value: bytes("me"),
                },
                Operation::AssertExists {
                    key: "lock".to_string(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(driver.snapshot().get("lock"), Some(&bytes("me")));
    }

    #[tokio::test]
    async fn test_range_batches() {
        let driver = MemoryDriver::new("test");
        for key in ["a", "b/1", "b/2", "b/3", "c"] {
            driver.set(key, bytes(key)).await.unwrap();
        }

        let first = driver
            .range(&RangeRequest {
                begin: b"b".to_vec(),
                begin_inclusive: true,
                end: Some(b"c".to_vec()),
                end_inclusive: false,
                max_elements: 2,
            })
            .await
            .unwrap();
        assert_eq!(first, vec!["b/1", "b/2"]);

        let second = driver
            .range_entries(&RangeRequest {
                begin: b"b/2".to_vec(),
                begin_inclusive: false,
                end: Some(b"c".to_vec()),
                end_inclusive: false,
                max_elements: 2,
            })
            .await
            .unwrap();
        assert_eq!(second, vec![("b/3".to_string(), bytes("b/3"))]);
    }

    #[tokio::test]
    async fn test_delete_prefix_and_assert_range() {
        let driver = MemoryDriver::new("test");
        for key in ["x/1", "x/2", "y"] {
            driver.set(key, bytes(key)).await.unwrap();
        }

        driver
            .sequence(&[Operation::AssertRange {
                prefix: "x/".to_string(),
                keys: vec!["x/1".to_string(), "x/2".to_string()],
            }])
            .await
            .unwrap();

        assert_eq!(driver.delete_prefix("x/").await.unwrap(), 2);
        assert_eq!(driver.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection_and_master_loss() {
        let driver = MemoryDriver::new("test");
        driver.fail_next(Error::SocketNotReadable("injected".to_string()));

        assert_matches!(driver.nop().await, Err(Error::SocketNotReadable(_)));
        assert!(driver.nop().await.is_ok());

        driver.set_master(None);
        assert_matches!(driver.nop().await, Err(Error::NoMaster(id)) if id == "test");
        assert_eq!(driver.calls(), 3);
    }

    #[tokio::test]
    async fn test_interleaved_write_breaks_asserts() {
        let driver = MemoryDriver::new("test");
        driver.set("k", bytes("old")).await.unwrap();
        driver.write_before_next_sequence("k", bytes("theirs"));

        let steps = [
            Operation::Assert {
                key: "k".to_string(),
                value: Some(bytes("old")),
            },
            Operation::Set {
                key: "k".to_string(),
                value: bytes("mine"),
            },
        ];
        assert_matches!(driver.sequence(&steps).await, Err(Error::AssertionFailed(_)));
        assert_eq!(driver.get("k", Consistency::default()).await.unwrap(), bytes("theirs"));

        // Only the next sequence is affected.
        driver.sequence(&steps[1..]).await.unwrap();
        assert_eq!(driver.get("k", Consistency::default()).await.unwrap(), bytes("mine"));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let driver = MemoryDriver::new("shared");
        let other = driver.clone();

        driver.set("k", bytes("v")).await.unwrap();

        assert!(other.exists("k").await.unwrap());
        assert_eq!(other.who_is_master().await.unwrap().as_deref(), Some(DEFAULT_MASTER));
    }
}
