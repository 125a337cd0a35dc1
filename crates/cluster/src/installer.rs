use std::collections::BTreeMap;

use ovs_arakoon::config::{CONFIG_ROOT, config_file};
use ovs_arakoon::{ClusterConfig, NodeConfig};
use ovs_arakoon_client::KeyValueClient;
use ovs_locks::LockManager;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{ClusterContext, get_service_name_for_cluster, port_lock_name};
use crate::factory::ClientFactory;
use crate::metadata::{ClusterMetadata, ClusterType, INTERNAL_CONFIG_KEY, METADATA_KEY};
use crate::node::NodeClient;
use crate::service::{ServiceDefinition, ServiceParams};
use crate::system::{PortRange, get_free_ports, machine_id};
use crate::Error;

/// Template every node service is installed from.
pub const SERVICE_TEMPLATE: &str = "ovs-arakoon";

/// Service store-backed nodes wait for before starting.
pub const CONFIG_WATCHER_SERVICE: &str = "ovs-watcher-config";

/// Database directory of a node of `cluster_name` under `base_dir`.
#[must_use]
pub fn home_dir(base_dir: &str, cluster_name: &str) -> String {
    format!("{}/arakoon/{cluster_name}/db", base_dir.trim_end_matches('/'))
}

/// Transaction log directory of a node of `cluster_name` under `base_dir`.
#[must_use]
pub fn tlog_dir(base_dir: &str, cluster_name: &str) -> String {
    format!("{}/arakoon/{cluster_name}/tlogs", base_dir.trim_end_matches('/'))
}

/// Where and how to place a new node.
#[derive(Clone, Debug)]
pub struct NodeRequest {
    /// Address of the host.
    pub ip: String,
    /// Directory to keep the database and tlogs under.
    pub base_dir: String,
    /// Log sink of the node.
    pub log_sinks: String,
    /// Crash log sink of the node.
    pub crash_log_sinks: String,
    /// Plugin names with the command printing their version.
    pub plugins: BTreeMap<String, String>,
    /// Serialise port allocation with other installers on the same host.
    pub locked: bool,
    /// Ports to pick from instead of the default for the host.
    pub port_range: Option<Vec<PortRange>>,
    /// Prefer this node during master election.
    pub preferred_master: bool,
}

impl NodeRequest {
    /// A locked placement on `ip` without plugins.
    pub fn new(
        ip: impl Into<String>,
        base_dir: impl Into<String>,
        log_sinks: impl Into<String>,
        crash_log_sinks: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            base_dir: base_dir.into(),
            log_sinks: log_sinks.into(),
            crash_log_sinks: crash_log_sinks.into(),
            plugins: BTreeMap::new(),
            locked: true,
            port_range: None,
            preferred_master: false,
        }
    }
}

/// Creates, resizes, restarts and removes one cluster.
///
/// The configuration is held in memory between calls: [`Self::load`] reads
/// it for an existing cluster, [`Self::create_cluster`] builds it for a new one.
#[derive(Debug)]
pub struct ArakoonInstaller<C: KeyValueClient, F, L> {
    context: ClusterContext<C, F, L>,
    cluster_name: String,
    config: Option<ClusterConfig>,
    metadata: Option<ClusterMetadata>,
    service_metadata: BTreeMap<String, Option<ServiceParams>>,
}

impl<C, F, L> ArakoonInstaller<C, F, L>
where
    C: KeyValueClient,
    F: ClientFactory,
    L: LockManager,
{
    /// An installer for `cluster_name`, nothing loaded yet.
    pub fn new(context: ClusterContext<C, F, L>, cluster_name: impl Into<String>) -> Self {
        Self {
            context,
            cluster_name: cluster_name.into(),
            config: None,
            metadata: None,
            service_metadata: BTreeMap::new(),
        }
    }

    /// Name of the cluster.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// The loaded configuration.
    pub const fn config(&self) -> Option<&ClusterConfig> {
        self.config.as_ref()
    }

    /// Metadata set up by [`Self::create_cluster`] or a claim.
    pub const fn metadata(&self) -> Option<&ClusterMetadata> {
        self.metadata.as_ref()
    }

    /// Service parameters of the last deploy, by node address; `None` for
    /// nodes without a service template.
    pub const fn service_metadata(&self) -> &BTreeMap<String, Option<ServiceParams>> {
        &self.service_metadata
    }

    /// Reads the configuration of an existing cluster, from the node at `ip`
    /// for filesystem-backed clusters.
    ///
    /// # Errors
    ///
    /// Fails if the configuration cannot be read.
    pub async fn load(&mut self, ip: Option<&str>) -> Result<(), Error> {
        self.config = Some(self.context.load_config(&self.cluster_name, ip).await?);
        Ok(())
    }

    /// Whether the loaded configuration lives on the nodes' filesystem.
    pub fn is_filesystem(&self) -> bool {
        self.config.as_ref().is_some_and(ClusterConfig::is_filesystem)
    }

    /// Client and messaging port of every node, by address.
    pub fn ports(&self) -> BTreeMap<String, [u16; 2]> {
        self.config.as_ref().map(ClusterConfig::ports).unwrap_or_default()
    }

    fn loaded(&self) -> Result<&ClusterConfig, Error> {
        self.config
            .as_ref()
            .ok_or_else(|| Error::ConfigNotLoaded(self.cluster_name.clone()))
    }

    /// Creates a single node cluster on `request.ip`. The cluster is not
    /// started and its metadata marks it unclaimed.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AlreadyExists`] when the cluster is configured,
    /// [`Error::OpenFiles`] when leftover data is still in use and
    /// [`Error::NoFreePorts`] when the host has no ports left.
    #[instrument(skip(self, request), fields(cluster = %self.cluster_name, ip = %request.ip))]
    pub async fn create_cluster(
        &mut self,
        cluster_type: ClusterType,
        internal: bool,
        request: NodeRequest,
    ) -> Result<(), Error> {
        let filesystem = cluster_type.is_filesystem();
        let client = self.context.connect(&request.ip).await?;
        let exists = if filesystem {
            client.file_exists(&config_file(&self.cluster_name)).await?
        } else {
            self.context
                .configuration()
                .dir_exists(&format!("{CONFIG_ROOT}/{}", self.cluster_name))
                .await?
        };
        if exists {
            return Err(Error::AlreadyExists(self.cluster_name.clone()));
        }

        debug!(cluster_type = %cluster_type, "creating cluster");
        let node_name = machine_id(client.as_ref()).await?;
        let home = home_dir(&request.base_dir, &self.cluster_name);
        let tlogs = tlog_dir(&request.base_dir, &self.cluster_name);
        self.context
            .clean_leftover_arakoon_data(&request.ip, &[home.clone(), tlogs.clone()])
            .await?;

        let lock = self.port_lock(&request).await?;
        let result = async {
            let ports = self.allocate_ports(client.as_ref(), filesystem, &request).await?;

            let mut config = if filesystem {
                ClusterConfig::on_filesystem(&self.cluster_name, &request.ip)
            } else {
                ClusterConfig::new(&self.cluster_name)
            };
            config.plugins = request.plugins.keys().cloned().collect();
            config
                .nodes
                .push(new_node(node_name, &request, &ports, home, tlogs));
            self.config = Some(config);
            self.metadata = Some(ClusterMetadata {
                internal,
                cluster_name: self.cluster_name.clone(),
                cluster_type,
                in_use: false,
            });
            self.deploy(&[], Some(&request.plugins), filesystem).await
        }
        .await;
        self.context.release(lock, result).await?;

        debug!(cluster_type = %cluster_type, "creating cluster completed");
        Ok(())
    }

    /// Adds a node on `request.ip` and redeploys every node.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::PluginMismatch`] when the request lacks a plugin
    /// of the cluster, or as [`Self::create_cluster`] does.
    #[instrument(skip(self, request), fields(cluster = %self.cluster_name, ip = %request.ip))]
    pub async fn extend_cluster(&mut self, request: NodeRequest) -> Result<(), Error> {
        let filesystem = self.loaded()?.is_filesystem();
        let client = self.context.connect(&request.ip).await?;
        let home = home_dir(&request.base_dir, &self.cluster_name);
        let tlogs = tlog_dir(&request.base_dir, &self.cluster_name);
        let node_name = machine_id(client.as_ref()).await?;
        self.context
            .clean_leftover_arakoon_data(&request.ip, &[home.clone(), tlogs.clone()])
            .await?;

        if let Some(missing) = self
            .loaded()?
            .plugins
            .iter()
            .find(|plugin| !request.plugins.contains_key(*plugin))
        {
            return Err(Error::PluginMismatch(missing.clone()));
        }

        let lock = self.port_lock(&request).await?;
        let result = async {
            let ports = self.allocate_ports(client.as_ref(), filesystem, &request).await?;
            if let Some(config) = self.config.as_mut() {
                if config.node(&node_name).is_none() {
                    config
                        .nodes
                        .push(new_node(node_name, &request, &ports, home, tlogs));
                }
            }
            self.deploy(&[], Some(&request.plugins), filesystem).await
        }
        .await;
        self.context.release(lock, result).await?;

        debug!("extending cluster completed");
        Ok(())
    }

    /// Removes the node on `removal_ip` and redeploys the others. Nodes in
    /// `offline_nodes` are left untouched.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NodeNotFound`] when no node runs on `removal_ip`.
    #[instrument(skip(self, offline_nodes), fields(cluster = %self.cluster_name))]
    pub async fn shrink_cluster(&mut self, removal_ip: &str, offline_nodes: &[String]) -> Result<(), Error> {
        let filesystem = self.loaded()?.is_filesystem();
        let removed = {
            let config = self
                .config
                .as_mut()
                .ok_or_else(|| Error::ConfigNotLoaded(self.cluster_name.clone()))?;
            let position = config
                .nodes
                .iter()
                .position(|node| node.ip == removal_ip)
                .ok_or_else(|| Error::NodeNotFound(removal_ip.to_string(), self.cluster_name.clone()))?;
            config.nodes.remove(position)
        };
        if removed.preferred_master {
            warn!(node = %removed.name, "preferred master node has been removed from the cluster");
        }

        if !offline_nodes.contains(&removed.ip) {
            self.destroy_node(&removed, filesystem).await?;
            if filesystem {
                let config = self.loaded()?;
                self.context.delete_config(config, removal_ip).await?;
            }
        }

        self.deploy(offline_nodes, None, filesystem).await?;
        self.context
            .services()
            .unregister_service(&removed.name, &get_service_name_for_cluster(&self.cluster_name))
            .await?;
        debug!(ip = %removal_ip, "shrinking cluster completed");
        Ok(())
    }

    /// Removes services, data and configuration of every node. Failures on
    /// one node are logged and do not stop the others.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is not loaded or cannot be removed from the store.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn delete_cluster(&mut self) -> Result<(), Error> {
        let config = self.loaded()?.clone();
        let service = get_service_name_for_cluster(&self.cluster_name);
        for node in &config.nodes {
            if let Err(error) = self.context.services().unregister_service(&node.name, &service).await {
                error!(ip = %node.ip, service = %service, error = %error, "un-registering service failed");
            }
        }

        for node in &config.nodes {
            if let Err(error) = self.destroy_node(node, config.is_filesystem()).await {
                error!(ip = %node.ip, error = %error, "destroying node failed");
            }
            if config.is_filesystem() {
                if let Err(error) = self.context.delete_config(&config, &node.ip).await {
                    error!(ip = %node.ip, error = %error, "removing configuration file failed");
                }
            }
        }
        if !config.is_filesystem() {
            self.context.delete_config(&config, "").await?;
        }

        info!("deleted cluster");
        Ok(())
    }

    /// Starts every node of a fresh cluster, then stores its configuration
    /// and marks it in use.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ConfigNotLoaded`] unless the cluster was created
    /// by this installer.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn start_cluster(&mut self) -> Result<(), Error> {
        let Some(mut metadata) = self.metadata.clone() else {
            return Err(Error::ConfigNotLoaded(self.cluster_name.clone()));
        };
        for node in &self.loaded()?.nodes {
            let root = self.context.connect_root(&node.ip).await?;
            self.context.start(&self.cluster_name, root.as_ref()).await?;
        }
        self.store_config().await?;

        metadata.in_use = true;
        let client = self.wait_for_cluster().await?;
        client.set(METADATA_KEY, metadata.encode()?, None).await?;
        self.metadata = Some(metadata);
        Ok(())
    }

    /// Restarts the node on the host of `client`, for changes that keep the
    /// configuration as is.
    ///
    /// # Errors
    ///
    /// Fails if the service does not restart or the cluster does not answer.
    pub async fn restart_node(&self, client: &dyn NodeClient) -> Result<(), Error> {
        if self.loaded()?.nodes.is_empty() {
            return Ok(());
        }
        self.context.stop(&self.cluster_name, client).await?;
        self.context.start(&self.cluster_name, client).await?;
        self.wait_for_cluster().await?;
        debug!(cluster = %self.cluster_name, ip = %client.ip(), "restarted node");
        Ok(())
    }

    /// Restarts the nodes one by one, keeping quorum when there are at least two.
    ///
    /// # Errors
    ///
    /// Fails on the first node that does not restart.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn restart_cluster(&self) -> Result<(), Error> {
        let config = self.loaded()?;
        for node in &config.nodes {
            self.restart_service(&node.ip).await?;
            if config.nodes.len() >= 2 {
                self.wait_for_cluster().await?;
            }
        }
        self.wait_for_cluster().await?;
        Ok(())
    }

    /// Brings the node added on `new_ip` into the cluster: catches it up,
    /// restarts the existing nodes and starts it.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NodeNotFound`] when the cluster has no node on `new_ip`.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn restart_cluster_after_extending(&self, new_ip: &str) -> Result<(), Error> {
        let config = self.loaded()?;
        let client = self.context.connect(new_ip).await?;
        if self.context.is_running(&self.cluster_name, client.as_ref()).await? {
            info!(ip = %new_ip, "service is already running");
            return Ok(());
        }

        let node = config
            .nodes
            .iter()
            .find(|node| node.ip == new_ip)
            .ok_or_else(|| Error::NodeNotFound(new_ip.to_string(), self.cluster_name.clone()))?;
        debug!(ip = %new_ip, "catching up new node");
        let config_path = self.context.external_config_path(config);
        client
            .run(&["arakoon", "--node", &node.name, "-config", &config_path, "-catchup-only"])
            .await?;

        for node in config.nodes.iter().filter(|node| node.ip != new_ip) {
            self.restart_service(&node.ip).await?;
            if config.nodes.len() >= 3 {
                self.wait_for_cluster().await?;
            }
        }

        let root = self.context.connect_root(new_ip).await?;
        self.context.start(&self.cluster_name, root.as_ref()).await?;
        self.store_config().await?;
        debug!(ip = %new_ip, "started new node");
        Ok(())
    }

    /// Restarts the remaining nodes after [`Self::shrink_cluster`].
    ///
    /// # Errors
    ///
    /// Fails on the first node that does not restart.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn restart_cluster_after_shrinking(&self) -> Result<(), Error> {
        let config = self.loaded()?;
        for node in &config.nodes {
            self.restart_service(&node.ip).await?;
            if config.nodes.len() >= 2 {
                self.wait_for_cluster().await?;
            }
        }
        self.store_config().await
    }

    /// Marks the cluster in use.
    ///
    /// # Errors
    ///
    /// Fails if the metadata cannot be read or written.
    pub async fn claim_cluster(&mut self) -> Result<(), Error> {
        self.set_in_use(true).await
    }

    /// Marks the cluster free to claim.
    ///
    /// # Errors
    ///
    /// Fails if the metadata cannot be read or written.
    pub async fn unclaim_cluster(&mut self) -> Result<(), Error> {
        self.set_in_use(false).await
    }

    async fn set_in_use(&mut self, in_use: bool) -> Result<(), Error> {
        let client = self.context.build_client(self.loaded()?);
        let mut metadata = ClusterMetadata::parse(&client.get(METADATA_KEY).await?)?;
        metadata.in_use = in_use;
        client.set(METADATA_KEY, metadata.encode()?, None).await?;
        self.metadata = Some(metadata);
        Ok(())
    }

    /// Stores the configuration inside the cluster itself.
    ///
    /// # Errors
    ///
    /// Fails if the cluster does not answer.
    pub async fn store_config(&self) -> Result<(), Error> {
        let client = self.wait_for_cluster().await?;
        client
            .set(INTERNAL_CONFIG_KEY, self.loaded()?.export_ini().into(), None)
            .await?;
        Ok(())
    }

    async fn wait_for_cluster(&self) -> Result<F::Client, Error> {
        debug!(cluster = %self.cluster_name, "waiting for cluster");
        let client = self.context.build_client(self.loaded()?);
        client.nop().await?;
        debug!(cluster = %self.cluster_name, "cluster available");
        Ok(client)
    }

    async fn restart_service(&self, ip: &str) -> Result<(), Error> {
        let root = self.context.connect_root(ip).await?;
        self.context.stop(&self.cluster_name, root.as_ref()).await?;
        self.context.start(&self.cluster_name, root.as_ref()).await?;
        debug!(cluster = %self.cluster_name, ip = %ip, "restarted node");
        Ok(())
    }

    async fn port_lock(&self, request: &NodeRequest) -> Result<Option<L::Lock>, Error> {
        if !request.locked {
            return Ok(None);
        }
        let wait = self.context.settings().port_lock_wait;
        Ok(Some(self.context.acquire(&port_lock_name(&request.ip), wait).await?))
    }

    async fn allocate_ports(
        &self,
        client: &dyn NodeClient,
        filesystem: bool,
        request: &NodeRequest,
    ) -> Result<Vec<u16>, Error> {
        if filesystem {
            let ranges = request
                .port_range
                .clone()
                .unwrap_or_else(|| self.context.settings().filesystem_port_range.clone());
            get_free_ports(client, &ranges, &[], 2).await
        } else {
            self.context.free_ports(client, request.port_range.clone()).await
        }
    }

    async fn destroy_node(&self, node: &NodeConfig, delay_unregistration: bool) -> Result<(), Error> {
        debug!(cluster = %self.cluster_name, ip = %node.ip, "destroying node");
        let root = self.context.connect_root(&node.ip).await?;
        self.context.stop(&self.cluster_name, root.as_ref()).await?;
        self.context
            .remove(&self.cluster_name, root.as_ref(), delay_unregistration)
            .await?;
        root.dir_delete(&node.directories()).await
    }

    /// Writes the configuration to every node not in `offline_nodes`, sets up
    /// their directories and installs their service.
    async fn deploy(
        &mut self,
        offline_nodes: &[String],
        plugins: Option<&BTreeMap<String, String>>,
        delay_registration: bool,
    ) -> Result<(), Error> {
        let config = self.loaded()?;
        debug!(cluster = %self.cluster_name, "deploying cluster");
        let user = self.context.settings().ssh_user.clone();
        let service = get_service_name_for_cluster(&self.cluster_name);
        let config_path = self.context.external_config_path(config);
        let extra_version_cmd = plugins
            .map(|plugins| plugins.values().map(String::as_str).collect::<Vec<_>>().join(";"))
            .unwrap_or_default();

        let mut service_metadata = BTreeMap::new();
        for node in config.nodes.iter().filter(|node| !offline_nodes.contains(&node.ip)) {
            let root = self.context.connect_root(&node.ip).await?;
            self.context.write_config(config, &node.ip).await?;

            let directories = node.directories();
            root.dir_create(&directories).await?;
            root.dir_chmod(&directories, 0o755, true).await?;
            root.dir_chown(&directories, &user, &user, true).await?;

            let mut params: Option<ServiceParams> = None;
            if !config.is_filesystem() {
                let services = self.context.services();
                let key = services.service_config_key(&machine_id(root.as_ref()).await?, &service);
                let configuration = self.context.configuration();
                if configuration.exists(&key).await? {
                    params = Some(serde_json::from_value(configuration.get(&key).await?)?);
                }
            }
            if params.is_none() {
                let definition = ServiceDefinition {
                    template: SERVICE_TEMPLATE.to_string(),
                    params: ServiceParams::from([
                        ("CLUSTER".to_string(), self.cluster_name.clone()),
                        ("NODE_ID".to_string(), node.name.clone()),
                        ("CONFIG_PATH".to_string(), config_path.clone()),
                        (
                            "EXTRA_VERSION_CMD".to_string(),
                            extra_version_cmd.trim_matches(';').to_string(),
                        ),
                    ]),
                    target_name: Some(format!("{SERVICE_TEMPLATE}-{}", self.cluster_name)),
                    startup_dependency: (!config.is_filesystem()).then(|| CONFIG_WATCHER_SERVICE.to_string()),
                    delay_registration,
                };
                params = self.context.services().add_service(root.as_ref(), definition).await?;
            }
            service_metadata.insert(node.ip.clone(), params);
            debug!(cluster = %self.cluster_name, ip = %node.ip, "deployed node");
        }

        self.service_metadata = service_metadata;
        Ok(())
    }
}

fn new_node(name: String, request: &NodeRequest, ports: &[u16], home: String, tlog_dir: String) -> NodeConfig {
    NodeConfig {
        client_port: ports[0],
        messaging_port: ports[1],
        home,
        tlog_dir,
        log_sinks: request.log_sinks.clone(),
        crash_log_sinks: request.crash_log_sinks.clone(),
        preferred_master: request.preferred_master,
        ..NodeConfig::new(name, &request.ip)
    }
}
