use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use ovs_arakoon_client::{Attempt, KeyValueClient};
use ovs_locks::Lock;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::Error;
use crate::record::{self, LockRecord};

/// Prefix under which lock records are stored.
pub const LOCK_PREFIX: &str = "/ovs/locks/";

/// Default validity of a lock record.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60);

/// Default delay between checks while the lock is taken.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Recommended refresh cadence for self-refreshing locks.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

const WAIT_WARNING_THRESHOLD: Duration = Duration::from_millis(200);
const HOLD_WARNING_THRESHOLD: Duration = Duration::from_millis(500);

/// Lock configuration. Unset fields fall back to the `DEFAULT_*` constants.
#[derive(Clone, Debug, Default)]
pub struct LockConfig {
    /// Default wait budget for `acquire`; `None` waits forever.
    pub wait: Option<Duration>,

    /// Validity of the record written on acquire and refresh.
    pub expiration: Option<Duration>,

    /// Delay between checks while the lock is taken.
    pub poll_interval: Option<Duration>,

    /// Refresh the record in the background at this cadence while held.
    /// `None` disables refreshing.
    pub refresh_interval: Option<Duration>,
}

#[derive(Default)]
struct Lease {
    record: Option<Bytes>,
    lost: Option<String>,
}

struct Shared<C> {
    client: C,
    key: String,
    id: String,
    expiration: Duration,
    lease: Mutex<Lease>,
    registry: Option<Arc<DashSet<String>>>,
}

struct Held {
    acquired_at: Instant,
    refresher: Option<JoinHandle<()>>,
}

/// Lease lock stored as a record in the key/value store.
///
/// Mutual exclusion comes from creating the record with an assert that the key
/// is absent. A record past its expiration is deleted by whoever notices it,
/// so an abandoned lock frees itself. The lock is not fenced: a holder stalled
/// past the expiration loses the lock silently unless it refreshes.
///
/// Dropping a held lock releases it in the background.
pub struct ArakoonLock<C: KeyValueClient> {
    name: String,
    shared: Arc<Shared<C>>,
    wait: Option<Duration>,
    poll_interval: Duration,
    refresh_interval: Option<Duration>,
    state: Mutex<Option<Held>>,
}

impl<C: KeyValueClient> Debug for ArakoonLock<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArakoonLock")
            .field("key", &self.shared.key)
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl<C: KeyValueClient> ArakoonLock<C> {
    /// Creates an unlocked instance of the lock called `name`.
    pub fn new(client: C, name: &str, config: LockConfig) -> Self {
        Self::with_registry(client, name, config, None)
    }

    pub(crate) fn with_registry(
        client: C,
        name: &str,
        config: LockConfig,
        registry: Option<Arc<DashSet<String>>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            shared: Arc::new(Shared {
                client,
                key: lock_key(name),
                id: Uuid::new_v4().to_string(),
                expiration: config.expiration.unwrap_or(DEFAULT_EXPIRATION),
                lease: Mutex::new(Lease::default()),
                registry,
            }),
            wait: config.wait,
            poll_interval: config.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            refresh_interval: config.refresh_interval,
            state: Mutex::new(None),
        }
    }

    /// Key of the lock record.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Identifier written into the record by this instance.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Extends the expiration of the held record now.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::LockLost`] if the record was replaced by another
    /// party; the lock no longer counts as held afterwards.
    pub async fn refresh(&self) -> Result<(), Error> {
        self.shared.refresh().await
    }

    async fn wait_until_free(&self, started: Instant, wait: Option<Duration>) -> Result<(), Error> {
        let client = &self.shared.client;
        let key = &self.shared.key;

        while client.exists(key).await? {
            match client.get(key).await {
                Ok(value) => match LockRecord::parse(&value) {
                    Some(current) if current.is_expired_at(record::now()) => {
                        self.remove_expired(value).await?;
                    }
                    Some(_) => {}
                    None => warn!(key = %key, "unreadable lock record, waiting for it to go away"),
                },
                // Released between the two reads.
                Err(error) if error.is_not_found() => continue,
                Err(error) => return Err(error.into()),
            }

            let waited = started.elapsed();
            if wait.is_some_and(|wait| waited > wait) {
                return Err(Error::NoLockAvailable {
                    key: key.clone(),
                    waited,
                });
            }
            sleep(self.poll_interval).await;
        }

        Ok(())
    }

    async fn remove_expired(&self, value: Bytes) -> Result<(), Error> {
        let client = &self.shared.client;
        let key = &self.shared.key;
        let transaction = client.begin_transaction();
        client
            .assert_value(key, Some(value), Some(transaction))
            .await?;
        client.delete(key, true, Some(transaction)).await?;

        match Attempt::classify(client.apply_transaction(transaction).await)? {
            Attempt::Done(()) => info!(key = %key, "removed expired lock record"),
            Attempt::Conflict(_) => {
                debug!(key = %key, "expired lock record changed before cleanup");
            }
        }

        Ok(())
    }

    async fn try_create(&self) -> Result<Option<Bytes>, Error> {
        let client = &self.shared.client;
        let key = &self.shared.key;
        let record = LockRecord::new(&self.shared.id, self.shared.expiration).encode()?;

        let transaction = client.begin_transaction();
        client.assert_value(key, None, Some(transaction)).await?;
        client
            .set(key, record.clone(), Some(transaction))
            .await?;

        Ok(match Attempt::classify(client.apply_transaction(transaction).await)? {
            Attempt::Done(()) => Some(record),
            Attempt::Conflict(_) => None,
        })
    }
}

impl<C: KeyValueClient> Shared<C> {
    async fn refresh(&self) -> Result<(), Error> {
        let mut lease = self.lease.lock().await;
        if let Some(reason) = &lease.lost {
            return Err(Error::LockLost(reason.clone()));
        }
        let Some(current) = lease.record.clone() else {
            return Ok(());
        };
        let record = LockRecord::new(&self.id, self.expiration).encode()?;

        let transaction = self.client.begin_transaction();
        self.client
            .assert_value(&self.key, Some(current), Some(transaction))
            .await?;
        self.client
            .set(&self.key, record.clone(), Some(transaction))
            .await?;

        match Attempt::classify(self.client.apply_transaction(transaction).await)? {
            Attempt::Done(()) => {
                debug!(key = %self.key, "refreshed lock record");
                lease.record = Some(record);
                Ok(())
            }
            Attempt::Conflict(_) => {
                let reason = format!("record {} was replaced by another party", self.key);
                error!(key = %self.key, id = %self.id, "lock was reclaimed while held");
                lease.record = None;
                lease.lost = Some(reason.clone());
                self.unregister();
                Err(Error::LockLost(reason))
            }
        }
    }

    /// Deletes the record if it is still ours. Returns the loss reason, if any.
    async fn release_record(&self) -> Result<Option<String>, Error> {
        let mut lease = self.lease.lock().await;
        self.unregister();
        if let Some(reason) = lease.lost.take() {
            return Ok(Some(reason));
        }
        let Some(record) = lease.record.take() else {
            return Ok(None);
        };

        let transaction = self.client.begin_transaction();
        self.client
            .assert_value(&self.key, Some(record), Some(transaction))
            .await?;
        self.client.delete(&self.key, true, Some(transaction)).await?;

        match Attempt::classify(self.client.apply_transaction(transaction).await)? {
            Attempt::Done(()) => debug!(key = %self.key, "lock record deleted"),
            Attempt::Conflict(_) => {
                warn!(key = %self.key, id = %self.id, "lock was already reclaimed by another party");
            }
        }

        Ok(None)
    }

    fn register(&self) {
        if let Some(registry) = &self.registry {
            registry.insert(self.id.clone());
        }
    }

    fn unregister(&self) {
        if let Some(registry) = &self.registry {
            registry.remove(&self.id);
        }
    }
}

fn spawn_refresher<C: KeyValueClient>(shared: Arc<Shared<C>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match shared.refresh().await {
                Ok(()) => {}
                Err(Error::LockLost(_)) => break,
                Err(error) => {
                    warn!(key = %shared.key, error = %error, "failed to refresh lock record");
                }
            }
        }
    })
}

#[async_trait]
impl<C: KeyValueClient> Lock for ArakoonLock<C> {
    type Error = Error;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(key = %self.shared.key, id = %self.shared.id))]
    async fn acquire(&self, wait: Option<Duration>) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        if let Some(held) = state.take() {
            let lease = self.shared.lease.lock().await;
            if lease.record.is_some() && lease.lost.is_none() {
                drop(lease);
                *state = Some(held);
                return Ok(());
            }
            drop(lease);
            // The lease was reclaimed; contend for the lock again.
            if let Some(refresher) = held.refresher {
                refresher.abort();
            }
            debug!("held lease was lost, acquiring anew");
        }

        let wait = wait.or(self.wait);
        let started = Instant::now();
        let record = loop {
            self.wait_until_free(started, wait).await?;
            if let Some(record) = self.try_create().await? {
                break record;
            }
            debug!("lost the race to create the lock record");
        };

        {
            let mut lease = self.shared.lease.lock().await;
            lease.record = Some(record);
            lease.lost = None;
        }
        self.shared.register();

        let waited = started.elapsed();
        if waited > WAIT_WARNING_THRESHOLD {
            warn!(waited = ?waited, "waited long for lock");
        }

        *state = Some(Held {
            acquired_at: Instant::now(),
            refresher: self
                .refresh_interval
                .map(|period| spawn_refresher(Arc::clone(&self.shared), period)),
        });

        Ok(())
    }

    #[instrument(skip(self), fields(key = %self.shared.key, id = %self.shared.id))]
    async fn release(&self) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        let Some(held) = state.take() else {
            return Ok(());
        };

        let outcome = self.shared.release_record().await;
        if let Some(refresher) = held.refresher {
            refresher.abort();
        }

        let held_for = held.acquired_at.elapsed();
        if held_for > HOLD_WARNING_THRESHOLD {
            warn!(held_for = ?held_for, "lock was held for a long time");
        }

        if let Some(reason) = outcome? {
            warn!(reason = %reason, "lock was lost before release, treating it as released");
        }
        Ok(())
    }

    async fn is_held(&self) -> bool {
        if self.state.lock().await.is_none() {
            return false;
        }
        let lease = self.shared.lease.lock().await;
        lease.record.is_some() && lease.lost.is_none()
    }
}

impl<C: KeyValueClient> Drop for ArakoonLock<C> {
    fn drop(&mut self) {
        let Some(held) = self.state.get_mut().take() else {
            return;
        };
        if let Some(refresher) = held.refresher {
            refresher.abort();
        }

        let shared = Arc::clone(&self.shared);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = shared.release_record().await {
                    warn!(key = %shared.key, error = %error, "failed to release dropped lock");
                }
            });
        } else {
            warn!(key = %shared.key, "held lock dropped outside a runtime, leaving it to expire");
        }
    }
}

fn lock_key(name: &str) -> String {
    format!("{LOCK_PREFIX}{name}")
}
