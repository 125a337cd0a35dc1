use std::fmt::{self, Debug};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ovs_arakoon::config::{CONFIG_ROOT, config_file, config_key};
use ovs_arakoon::ClusterConfig;
use ovs_arakoon_client::{Attempt, KeyValueClient, random_retry_wait};
use ovs_configuration::Configuration;
use ovs_locks::{Lock, LockError, LockManager};
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::factory::ClientFactory;
use crate::metadata::{ClusterMetadata, ClusterType, METADATA_KEY};
use crate::node::{NodeClient, NodeConnector};
use crate::service::{ServiceManager, ServiceStatus};
use crate::system::{PortRange, get_free_ports, machine_id};
use crate::Error;

/// Default user for regular node access and data ownership.
pub const DEFAULT_SSH_USER: &str = "ovs";

/// User for operations needing full privileges.
pub const ROOT_USER: &str = "root";

/// Default wait for the per-host port allocation lock.
pub const DEFAULT_PORT_LOCK_WAIT: Duration = Duration::from_secs(60);

/// Default wait for the global metadata claim lock.
pub const DEFAULT_CLAIM_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Default first port for clusters whose configuration lives on the filesystem.
pub const DEFAULT_FILESYSTEM_PORT: u16 = 26400;

/// Default time a service gets to start or stop.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration key mapping internal cluster names to the names users know.
pub const CLUSTER_NAMES_KEY: &str = "/ovs/framework/arakoon_clusters";

/// Name of the lock serialising metadata claims.
pub const CLAIM_LOCK: &str = "claim_arakoon_metadata";

const CLAIM_ATTEMPTS: usize = 5;

/// Lock name serialising port allocation on `ip`.
#[must_use]
pub fn port_lock_name(ip: &str) -> String {
    format!("arakoon_install_ports_{ip}")
}

/// Name of the service running a node of `cluster_name`.
#[must_use]
pub fn get_service_name_for_cluster(cluster_name: &str) -> String {
    format!("arakoon-{cluster_name}")
}

/// Configuration key of the default port range of a host.
#[must_use]
pub fn host_port_range_key(node_id: &str) -> String {
    format!("/ovs/framework/hosts/{node_id}/ports|arakoon")
}

/// Tunables of [`ClusterContext`]; `None` picks the documented default.
#[derive(Clone, Debug, Default)]
pub struct InstallerConfig {
    /// User for node access and data ownership, [`DEFAULT_SSH_USER`] by default.
    pub ssh_user: Option<String>,
    /// Wait for the port allocation lock, [`DEFAULT_PORT_LOCK_WAIT`] by default.
    pub port_lock_wait: Option<Duration>,
    /// Wait for the claim lock, [`DEFAULT_CLAIM_LOCK_WAIT`] by default.
    pub claim_lock_wait: Option<Duration>,
    /// Ports for filesystem-backed clusters, from [`DEFAULT_FILESYSTEM_PORT`] by default.
    pub filesystem_port_range: Option<Vec<PortRange>>,
    /// Time a service gets to start or stop, [`DEFAULT_SERVICE_TIMEOUT`] by default.
    pub service_timeout: Option<Duration>,
}

pub(crate) struct Settings {
    pub(crate) ssh_user: String,
    pub(crate) port_lock_wait: Duration,
    pub(crate) claim_lock_wait: Duration,
    pub(crate) filesystem_port_range: Vec<PortRange>,
    pub(crate) service_timeout: Duration,
}

struct Inner<C: KeyValueClient, F, L> {
    configuration: Configuration<C>,
    connector: Arc<dyn NodeConnector>,
    services: Arc<dyn ServiceManager>,
    clients: F,
    locks: L,
    settings: Settings,
}

/// Collaborators shared by every installer, plus the operations that do not
/// belong to a single cluster.
///
/// Created once and handed to each [`crate::ArakoonInstaller`]. Cloning is cheap.
pub struct ClusterContext<C: KeyValueClient, F, L> {
    inner: Arc<Inner<C, F, L>>,
}

impl<C: KeyValueClient, F, L> Clone for ClusterContext<C, F, L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: KeyValueClient, F: Debug, L: Debug> Debug for ClusterContext<C, F, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterContext")
            .field("connector", &self.inner.connector)
            .field("services", &self.inner.services)
            .field("clients", &self.inner.clients)
            .field("locks", &self.inner.locks)
            .field("ssh_user", &self.inner.settings.ssh_user)
            .finish_non_exhaustive()
    }
}

impl<C, F, L> ClusterContext<C, F, L>
where
    C: KeyValueClient,
    F: ClientFactory,
    L: LockManager,
{
    /// Bundles the collaborators.
    pub fn new(
        configuration: Configuration<C>,
        connector: Arc<dyn NodeConnector>,
        services: Arc<dyn ServiceManager>,
        clients: F,
        locks: L,
        config: InstallerConfig,
    ) -> Self {
        let settings = Settings {
            ssh_user: config.ssh_user.unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
            port_lock_wait: config.port_lock_wait.unwrap_or(DEFAULT_PORT_LOCK_WAIT),
            claim_lock_wait: config.claim_lock_wait.unwrap_or(DEFAULT_CLAIM_LOCK_WAIT),
            filesystem_port_range: config
                .filesystem_port_range
                .unwrap_or_else(|| vec![PortRange::From(DEFAULT_FILESYSTEM_PORT)]),
            service_timeout: config.service_timeout.unwrap_or(DEFAULT_SERVICE_TIMEOUT),
        };

        Self {
            inner: Arc::new(Inner {
                configuration,
                connector,
                services,
                clients,
                locks,
                settings,
            }),
        }
    }

    /// The configuration store.
    pub fn configuration(&self) -> &Configuration<C> {
        &self.inner.configuration
    }

    /// The service manager.
    pub fn services(&self) -> &dyn ServiceManager {
        self.inner.services.as_ref()
    }

    /// The client factory.
    pub fn clients(&self) -> &F {
        &self.inner.clients
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Connects to `ip` as the regular user.
    ///
    /// # Errors
    ///
    /// Fails if the host cannot be reached.
    pub async fn connect(&self, ip: &str) -> Result<Arc<dyn NodeClient>, Error> {
        self.inner.connector.connect(ip, &self.inner.settings.ssh_user).await
    }

    /// Connects to `ip` as root.
    ///
    /// # Errors
    ///
    /// Fails if the host cannot be reached.
    pub async fn connect_root(&self, ip: &str) -> Result<Arc<dyn NodeClient>, Error> {
        self.inner.connector.connect(ip, ROOT_USER).await
    }

    pub(crate) async fn acquire(&self, name: &str, wait: Duration) -> Result<L::Lock, Error> {
        let lock = self.inner.locks.lock(name, Some(wait), None);
        match lock.acquire(Some(wait)).await {
            Ok(()) => Ok(lock),
            Err(error) if error.is_unavailable() => {
                warn!(lock = %name, wait = ?wait, "lock still taken, giving up");
                Err(Error::LockTimeout {
                    name: name.to_string(),
                    wait,
                })
            }
            Err(error) => Err(Error::lock(error)),
        }
    }

    /// Releases `lock` (if any) and hands back `result`; a failed release
    /// only surfaces when `result` is a success.
    pub(crate) async fn release<T>(&self, lock: Option<L::Lock>, result: Result<T, Error>) -> Result<T, Error> {
        let Some(lock) = lock else {
            return result;
        };
        match (lock.release().await, result) {
            (Ok(()), result) => result,
            (Err(error), Ok(_)) => Err(Error::lock(error)),
            (Err(error), Err(original)) => {
                warn!(lock = %lock.name(), error = %error, "releasing lock failed");
                Err(original)
            }
        }
    }

    /// Reads the configuration of `cluster_name`, from the store or, for
    /// filesystem-backed clusters, from the node at `ip`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is missing or malformed.
    pub async fn load_config(&self, cluster_name: &str, ip: Option<&str>) -> Result<ClusterConfig, Error> {
        match ip {
            None => {
                let raw = self
                    .inner
                    .configuration
                    .get_raw(&config_key(cluster_name))
                    .await?;
                Ok(ClusterConfig::from_ini(cluster_name, &String::from_utf8_lossy(&raw))?)
            }
            Some(ip) => {
                let contents = self.connect(ip).await?.file_read(&config_file(cluster_name)).await?;
                let mut config = ClusterConfig::on_filesystem(cluster_name, ip);
                config.read_ini(&contents)?;
                Ok(config)
            }
        }
    }

    /// Writes `config` where it is read from: the store, or the node at `ip`.
    pub(crate) async fn write_config(&self, config: &ClusterConfig, ip: &str) -> Result<(), Error> {
        let contents = config.export_ini();
        if config.is_filesystem() {
            self.connect(ip)
                .await?
                .file_write(&config.internal_config_path(), &contents)
                .await
        } else {
            self.inner
                .configuration
                .set_raw(&config.internal_config_path(), contents.into())
                .await?;
            Ok(())
        }
    }

    pub(crate) async fn delete_config(&self, config: &ClusterConfig, ip: &str) -> Result<(), Error> {
        let path = config.internal_config_path();
        if config.is_filesystem() {
            return self.connect(ip).await?.file_delete(&[path]).await;
        }

        let store = self.inner.configuration.store();
        if store.exists(&path).await? {
            store.delete(&path, false, None).await?;
        }
        Ok(())
    }

    /// Locator of the configuration as handed to the node processes.
    pub(crate) fn external_config_path(&self, config: &ClusterConfig) -> String {
        let path = config.internal_config_path();
        if config.is_filesystem() {
            path
        } else {
            self.inner.configuration.store().get_configuration_path(&path)
        }
    }

    /// Names of the clusters configured in the store.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read.
    pub async fn cluster_names(&self) -> Result<Vec<String>, Error> {
        let configuration = &self.inner.configuration;
        if !configuration.dir_exists(CONFIG_ROOT).await? {
            return Ok(Vec::new());
        }
        Ok(configuration
            .list(CONFIG_ROOT, false)
            .collect::<Result<Vec<_>, _>>()
            .await?)
    }

    /// A client for `config`.
    pub fn build_client(&self, config: &ClusterConfig) -> F::Client {
        self.inner.clients.build(config)
    }

    /// Reads the metadata stored inside `cluster_name`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration or the metadata cannot be read.
    pub async fn get_arakoon_metadata_by_cluster_name(
        &self,
        cluster_name: &str,
        ip: Option<&str>,
    ) -> Result<ClusterMetadata, Error> {
        let config = self.load_config(cluster_name, ip).await?;
        let client = self.build_client(&config);
        ClusterMetadata::parse(&client.get(METADATA_KEY).await?)
    }

    /// Metadata of every unclaimed cluster of `cluster_type`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::UnsupportedClusterType`] for [`ClusterType::Cfg`],
    /// whose clusters are not known to the store.
    pub async fn get_unused_arakoon_clusters(&self, cluster_type: ClusterType) -> Result<Vec<ClusterMetadata>, Error> {
        if cluster_type == ClusterType::Cfg {
            let supported: Vec<ClusterType> = ClusterType::ALL
                .into_iter()
                .filter(|kind| *kind != ClusterType::Cfg)
                .collect();
            return Err(ClusterType::unsupported(cluster_type.as_str(), &supported));
        }

        let mut unused = Vec::new();
        for cluster_name in self.cluster_names().await? {
            let metadata = self.get_arakoon_metadata_by_cluster_name(&cluster_name, None).await?;
            if metadata.cluster_type == cluster_type && !metadata.in_use {
                unused.push(metadata);
            }
        }
        Ok(unused)
    }

    /// Claims the first unclaimed, external cluster of `cluster_type`
    /// (restricted to `cluster_name` when given) and returns its metadata.
    ///
    /// Claims are serialised by a global lock, except for types that only
    /// ever have a single writer.
    ///
    /// # Errors
    ///
    /// Fails if the lock cannot be taken or a cluster cannot be read.
    #[instrument(skip(self))]
    pub async fn get_unused_arakoon_metadata_and_claim(
        &self,
        cluster_type: ClusterType,
        cluster_name: Option<&str>,
    ) -> Result<Option<ClusterMetadata>, Error> {
        if !self.inner.configuration.dir_exists(CONFIG_ROOT).await? {
            return Ok(None);
        }

        let lock = if matches!(cluster_type, ClusterType::Cfg | ClusterType::Fwk) {
            None
        } else {
            Some(self.acquire(CLAIM_LOCK, self.inner.settings.claim_lock_wait).await?)
        };
        let result = self.claim_first(cluster_type, cluster_name).await;
        self.release(lock, result).await
    }

    async fn claim_first(
        &self,
        cluster_type: ClusterType,
        cluster_name: Option<&str>,
    ) -> Result<Option<ClusterMetadata>, Error> {
        for candidate in self.cluster_names().await? {
            if cluster_name.is_some_and(|name| name != candidate) {
                continue;
            }
            let config = self.load_config(&candidate, None).await?;
            let client = self.build_client(&config);
            let claimed = update_metadata(&client, |metadata| {
                if !metadata.is_claimable(cluster_type) {
                    return false;
                }
                metadata.in_use = true;
                true
            })
            .await?;
            if let Some(metadata) = claimed {
                info!(cluster = %candidate, cluster_type = %cluster_type, "claimed cluster");
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }

    /// Name users know the internally named cluster by, `None` for the
    /// framework's own clusters without an explicit name.
    ///
    /// # Errors
    ///
    /// Fails if the name mapping cannot be read.
    pub async fn get_cluster_name(&self, internal_name: &str) -> Result<Option<String>, Error> {
        match self.inner.configuration.get(CLUSTER_NAMES_KEY).await {
            Ok(names) => {
                if let Some(name) = names.get(internal_name).and_then(Value::as_str) {
                    return Ok(Some(name.to_string()));
                }
            }
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error.into()),
        }
        Ok((!matches!(internal_name, "ovsdb" | "voldrv")).then(|| internal_name.to_string()))
    }

    /// Free client and messaging ports on the host of `client`, avoiding
    /// ports of other clusters already placed on it.
    pub(crate) async fn free_ports(
        &self,
        client: &dyn NodeClient,
        port_range: Option<Vec<PortRange>>,
    ) -> Result<Vec<u16>, Error> {
        let node_id = machine_id(client).await?;
        let mut clusters = Vec::new();
        let mut exclude = Vec::new();
        for cluster_name in self.cluster_names().await? {
            let config = self.load_config(&cluster_name, None).await?;
            if let Some(node) = config.node(&node_id) {
                exclude.extend([node.client_port, node.messaging_port]);
                clusters.push(cluster_name);
            }
        }

        let ranges = match port_range {
            Some(ranges) => ranges,
            None => serde_json::from_value(
                self.inner
                    .configuration
                    .get(&host_port_range_key(&node_id))
                    .await?,
            )?,
        };
        let ports = get_free_ports(client, &ranges, &exclude, 2).await?;
        debug!(ports = ?ports, clusters = ?clusters, "loaded free ports based on existing clusters");
        Ok(ports)
    }

    /// Removes leftover data from `directories` on `ip`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OpenFiles`], removing nothing, when a process
    /// still holds any of the files open.
    #[instrument(skip(self))]
    pub async fn clean_leftover_arakoon_data(&self, ip: &str, directories: &[String]) -> Result<(), Error> {
        let root = self.connect_root(ip).await?;
        let mut open_files = Vec::new();
        let mut leftovers = Vec::new();

        for directory in directories {
            if !root.dir_exists(directory).await? {
                continue;
            }
            let files = root.file_list(directory, true).await?;
            for file in &files {
                // lsof exits non-zero when nobody has the file open.
                let output = root.try_run(&["lsof", file]).await?;
                if output.succeeded() && !output.stdout.trim().is_empty() {
                    let name = Path::new(file)
                        .file_name()
                        .map_or_else(|| file.clone(), |name| name.to_string_lossy().into_owned());
                    open_files.push(format!("Open file {name} detected in directory {directory}"));
                }
            }
            if !files.is_empty() {
                leftovers.push((directory, files));
            }
        }

        if !open_files.is_empty() {
            return Err(Error::OpenFiles(open_files));
        }
        for (directory, files) in leftovers {
            debug!(directory = %directory, files = files.len(), "removing leftover files");
            root.file_delete(&files).await?;
        }
        Ok(())
    }

    /// Starts the service of `cluster_name` on the host of `client`, if installed.
    ///
    /// # Errors
    ///
    /// Fails if the service does not start in time.
    pub async fn start(&self, cluster_name: &str, client: &dyn NodeClient) -> Result<(), Error> {
        let service = get_service_name_for_cluster(cluster_name);
        let services = self.services();
        if services.has_service(&service, client).await? {
            services
                .start_service(&service, client, self.inner.settings.service_timeout)
                .await?;
        }
        Ok(())
    }

    /// Stops the service of `cluster_name` on the host of `client`, if installed.
    ///
    /// # Errors
    ///
    /// Fails if the service does not stop in time.
    pub async fn stop(&self, cluster_name: &str, client: &dyn NodeClient) -> Result<(), Error> {
        let service = get_service_name_for_cluster(cluster_name);
        let services = self.services();
        if services.has_service(&service, client).await? {
            services
                .stop_service(&service, client, self.inner.settings.service_timeout)
                .await?;
        }
        Ok(())
    }

    /// Whether the service of `cluster_name` runs on the host of `client`.
    ///
    /// # Errors
    ///
    /// Fails if the status cannot be queried.
    pub async fn is_running(&self, cluster_name: &str, client: &dyn NodeClient) -> Result<bool, Error> {
        let service = get_service_name_for_cluster(cluster_name);
        let services = self.services();
        if !services.has_service(&service, client).await? {
            return Ok(false);
        }
        Ok(services.get_service_status(&service, client).await? == ServiceStatus::Active)
    }

    /// Uninstalls the service of `cluster_name` from the host of `client`, if installed.
    ///
    /// # Errors
    ///
    /// Fails if the service cannot be removed.
    pub async fn remove(&self, cluster_name: &str, client: &dyn NodeClient, delay_unregistration: bool) -> Result<(), Error> {
        let service = get_service_name_for_cluster(cluster_name);
        let services = self.services();
        if services.has_service(&service, client).await? {
            services
                .remove_service(&service, client, delay_unregistration)
                .await?;
        }
        Ok(())
    }
}

/// Rewrites the metadata of the cluster behind `client` when `update` says
/// so, guarded against concurrent writers.
///
/// Returns the new metadata, or `None` when `update` declined.
pub(crate) async fn update_metadata<K, U>(client: &K, update: U) -> Result<Option<ClusterMetadata>, Error>
where
    K: KeyValueClient,
    U: Fn(&mut ClusterMetadata) -> bool + Send + Sync,
{
    for attempt in 1..=CLAIM_ATTEMPTS {
        let current = match client.get(METADATA_KEY).await {
            Ok(current) => current,
            Err(error) if error.is_not_found() => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let mut metadata = ClusterMetadata::parse(&current)?;
        if !update(&mut metadata) {
            return Ok(None);
        }

        let transaction = client.begin_transaction();
        client
            .assert_value(METADATA_KEY, Some(current), Some(transaction))
            .await?;
        client
            .set(METADATA_KEY, metadata.encode()?, Some(transaction))
            .await?;
        match Attempt::classify(client.apply_transaction(transaction).await)? {
            Attempt::Done(()) => return Ok(Some(metadata)),
            Attempt::Conflict(error) if attempt == CLAIM_ATTEMPTS => return Err(error.into()),
            Attempt::Conflict(_) => {
                debug!(cluster = %client.cluster_id(), attempt, "metadata changed concurrently, retrying");
                tokio::time::sleep(random_retry_wait()).await;
            }
        }
    }
    Ok(None)
}
