//! In-memory hosts, services and clusters for exercising the installer
//! without touching real machines.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ovs_arakoon::ClusterConfig;
use ovs_arakoon_client::{ArakoonClient, ClientConfig};
use ovs_arakoon_memory::MemoryDriver;
use parking_lot::Mutex;

use crate::factory::ClientFactory;
use crate::node::{CommandOutput, NodeClient, NodeConnector};
use crate::service::{ServiceDefinition, ServiceManager, ServiceParams, ServiceStatus, SERVICE_PREFIX};
use crate::system::{EPHEMERAL_PORT_RANGE_FILE, MACHINE_ID_FILE, machine_id};
use crate::Error;

#[derive(Debug, Default)]
struct HostState {
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    modes: BTreeMap<String, u32>,
    owners: BTreeMap<String, String>,
    commands: Vec<String>,
    responses: HashMap<String, VecDeque<CommandOutput>>,
}

fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .map(|(index, _)| &path[..index])
        .chain(std::iter::once(path))
        .filter(|parent| !parent.is_empty())
}

fn is_below(path: &str, directory: &str) -> bool {
    path.strip_prefix(directory)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// A simulated host with its own file tree and scripted command output.
///
/// Every clone and every client of the host shares the same state.
#[derive(Clone, Debug)]
pub struct MockHost {
    ip: String,
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    /// A host identified by `machine_id` with the usual ephemeral port range.
    pub fn new(ip: impl Into<String>, machine_id: &str) -> Self {
        let host = Self {
            ip: ip.into(),
            state: Arc::default(),
        };
        host.write_file(MACHINE_ID_FILE, &format!("{machine_id}\n"));
        host.write_file(EPHEMERAL_PORT_RANGE_FILE, "32768\t60999\n");
        host
    }

    /// Address of the host.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// A client acting as `user`.
    pub fn client(&self, user: &str) -> MockNodeClient {
        MockNodeClient {
            host: self.clone(),
            user: user.to_string(),
        }
    }

    /// Queues `output` for the next run of `command` (arguments joined by
    /// spaces). The last queued output keeps being returned; unscripted
    /// commands succeed without output.
    pub fn respond(&self, command: &str, output: CommandOutput) {
        self.state
            .lock()
            .responses
            .entry(command.to_string())
            .or_default()
            .push_back(output);
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Contents of a file.
    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().files.get(path).cloned()
    }

    /// Creates or replaces a file.
    pub fn write_file(&self, path: &str, contents: &str) {
        let mut state = self.state.lock();
        if let Some((parent, _)) = path.rsplit_once('/') {
            for directory in ancestors(parent) {
                state.dirs.insert(directory.to_string());
            }
        }
        state.files.insert(path.to_string(), contents.to_string());
    }

    /// Whether a directory exists.
    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().dirs.contains(path)
    }

    /// Permission bits last set on `path`.
    pub fn mode(&self, path: &str) -> Option<u32> {
        self.state.lock().modes.get(path).copied()
    }

    /// `user:group` last set on `path`.
    pub fn owner(&self, path: &str) -> Option<String> {
        self.state.lock().owners.get(path).cloned()
    }
}

/// [`NodeClient`] of a [`MockHost`].
#[derive(Clone, Debug)]
pub struct MockNodeClient {
    host: MockHost,
    user: String,
}

#[async_trait]
impl NodeClient for MockNodeClient {
    fn ip(&self) -> &str {
        &self.host.ip
    }

    fn user(&self) -> &str {
        &self.user
    }

    async fn try_run(&self, argv: &[&str]) -> Result<CommandOutput, Error> {
        let command = argv.join(" ");
        let mut state = self.host.state.lock();
        state.commands.push(command.clone());

        Ok(match state.responses.get_mut(&command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => CommandOutput::success(""),
        })
    }

    async fn file_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.host.state.lock().files.contains_key(path))
    }

    async fn file_read(&self, path: &str) -> Result<String, Error> {
        self.host.file(path).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("{path} on {}", self.host.ip)).into()
        })
    }

    async fn file_write(&self, path: &str, contents: &str) -> Result<(), Error> {
        self.host.write_file(path, contents);
        Ok(())
    }

    async fn file_delete(&self, paths: &[String]) -> Result<(), Error> {
        let mut state = self.host.state.lock();
        for path in paths {
            state.files.remove(path);
        }
        Ok(())
    }

    async fn file_list(&self, directory: &str, recursive: bool) -> Result<Vec<String>, Error> {
        let directory = directory.trim_end_matches('/');
        Ok(self
            .host
            .state
            .lock()
            .files
            .keys()
            .filter(|path| is_below(path, directory))
            .filter(|path| recursive || !path[directory.len() + 1..].contains('/'))
            .cloned()
            .collect())
    }

    async fn dir_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.host.has_dir(path.trim_end_matches('/')))
    }

    async fn dir_create(&self, paths: &[String]) -> Result<(), Error> {
        let mut state = self.host.state.lock();
        for path in paths {
            for directory in ancestors(path.trim_end_matches('/')) {
                state.dirs.insert(directory.to_string());
            }
        }
        Ok(())
    }

    async fn dir_delete(&self, paths: &[String]) -> Result<(), Error> {
        let mut state = self.host.state.lock();
        for path in paths {
            let path = path.trim_end_matches('/');
            state.dirs.retain(|directory| directory != path && !is_below(directory, path));
            state.files.retain(|file, _| !is_below(file, path));
        }
        Ok(())
    }

    async fn dir_chmod(&self, paths: &[String], mode: u32, _recursive: bool) -> Result<(), Error> {
        let mut state = self.host.state.lock();
        for path in paths {
            state.modes.insert(path.clone(), mode);
        }
        Ok(())
    }

    async fn dir_chown(&self, paths: &[String], user: &str, group: &str, _recursive: bool) -> Result<(), Error> {
        let mut state = self.host.state.lock();
        for path in paths {
            state.owners.insert(path.clone(), format!("{user}:{group}"));
        }
        Ok(())
    }
}

/// [`NodeConnector`] over a set of [`MockHost`]s.
#[derive(Clone, Debug, Default)]
pub struct MockConnector {
    hosts: Arc<DashMap<String, MockHost>>,
}

impl MockConnector {
    /// An empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host reachable at `ip`.
    pub fn add_host(&self, ip: &str, machine_id: &str) -> MockHost {
        let host = MockHost::new(ip, machine_id);
        self.hosts.insert(ip.to_string(), host.clone());
        host
    }

    /// The host at `ip`.
    pub fn host(&self, ip: &str) -> Option<MockHost> {
        self.hosts.get(ip).map(|host| host.clone())
    }

    /// Makes `ip` unreachable.
    pub fn remove_host(&self, ip: &str) -> Option<MockHost> {
        self.hosts.remove(ip).map(|(_, host)| host)
    }
}

#[async_trait]
impl NodeConnector for MockConnector {
    async fn connect(&self, ip: &str, user: &str) -> Result<Arc<dyn NodeClient>, Error> {
        let host = self.host(ip).ok_or_else(|| Error::Unreachable {
            ip: ip.to_string(),
            user: user.to_string(),
        })?;
        Ok(Arc::new(host.client(user)))
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    services: BTreeMap<(String, String), ServiceStatus>,
    registrations: BTreeMap<String, ServiceParams>,
    events: Vec<String>,
}

/// [`ServiceManager`] keeping services and registrations in memory.
///
/// Every install, start, stop and removal is logged as `"<action> <name>@<ip>"`.
/// Installing a service that is already there keeps its state.
#[derive(Clone, Debug, Default)]
pub struct MockServiceManager {
    state: Arc<Mutex<ServiceState>>,
}

impl MockServiceManager {
    /// No services anywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Actions taken so far, in order.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    /// Installed services as `(ip, name)` with their state.
    pub fn services(&self) -> BTreeMap<(String, String), ServiceStatus> {
        self.state.lock().services.clone()
    }

    /// Registered parameters by configuration key.
    pub fn registrations(&self) -> BTreeMap<String, ServiceParams> {
        self.state.lock().registrations.clone()
    }

    fn lookup(state: &ServiceState, ip: &str, name: &str) -> Option<(String, String)> {
        [name.to_string(), format!("{SERVICE_PREFIX}{name}")]
            .into_iter()
            .map(|candidate| (ip.to_string(), candidate))
            .find(|key| state.services.contains_key(key))
    }

    fn transition(&self, name: &str, client: &dyn NodeClient, action: &str, status: ServiceStatus) -> Result<(), Error> {
        let mut state = self.state.lock();
        let key = Self::lookup(&state, client.ip(), name).ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        state.events.push(format!("{action} {}@{}", key.1, key.0));
        state.services.insert(key, status);
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for MockServiceManager {
    async fn add_service(
        &self,
        client: &dyn NodeClient,
        definition: ServiceDefinition,
    ) -> Result<Option<ServiceParams>, Error> {
        let name = definition.target_name.unwrap_or(definition.template);
        let mut params = definition.params;
        params.insert(
            "SERVICE_NAME".to_string(),
            name.strip_prefix(SERVICE_PREFIX).unwrap_or(&name).to_string(),
        );
        params.insert(
            "STARTUP_DEPENDENCY".to_string(),
            definition
                .startup_dependency
                .map(|dependency| format!("{dependency}.service"))
                .unwrap_or_default(),
        );

        {
            let mut state = self.state.lock();
            state.events.push(format!("add {name}@{}", client.ip()));
            state
                .services
                .entry((client.ip().to_string(), name))
                .or_insert(ServiceStatus::Inactive);
        }
        if !definition.delay_registration {
            self.register_service(&machine_id(client).await?, &params).await?;
        }
        Ok(Some(params))
    }

    async fn has_service(&self, name: &str, client: &dyn NodeClient) -> Result<bool, Error> {
        Ok(Self::lookup(&self.state.lock(), client.ip(), name).is_some())
    }

    async fn get_service_status(&self, name: &str, client: &dyn NodeClient) -> Result<ServiceStatus, Error> {
        let state = self.state.lock();
        Self::lookup(&state, client.ip(), name)
            .and_then(|key| state.services.get(&key).cloned())
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    async fn start_service(&self, name: &str, client: &dyn NodeClient, _timeout: Duration) -> Result<(), Error> {
        self.transition(name, client, "start", ServiceStatus::Active)
    }

    async fn stop_service(&self, name: &str, client: &dyn NodeClient, _timeout: Duration) -> Result<(), Error> {
        self.transition(name, client, "stop", ServiceStatus::Inactive)
    }

    async fn remove_service(&self, name: &str, client: &dyn NodeClient, delay_unregistration: bool) -> Result<(), Error> {
        let removed = {
            let mut state = self.state.lock();
            let key = Self::lookup(&state, client.ip(), name).ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
            state.events.push(format!("remove {}@{}", key.1, key.0));
            state.services.remove(&key);
            key.1
        };
        if !delay_unregistration {
            self.unregister_service(&machine_id(client).await?, &removed).await?;
        }
        Ok(())
    }

    async fn register_service(&self, node_id: &str, params: &ServiceParams) -> Result<(), Error> {
        let service = params.get("SERVICE_NAME").map_or("", String::as_str);
        let key = self.service_config_key(node_id, service);
        self.state.lock().registrations.insert(key, params.clone());
        Ok(())
    }

    async fn unregister_service(&self, node_id: &str, service_name: &str) -> Result<(), Error> {
        let key = self.service_config_key(node_id, service_name);
        self.state.lock().registrations.remove(&key);
        Ok(())
    }
}

/// [`ClientFactory`] handing out clients of in-memory clusters, one per
/// cluster id, created on first use.
#[derive(Clone, Debug, Default)]
pub struct MemoryClientFactory {
    drivers: Arc<DashMap<String, MemoryDriver>>,
}

impl MemoryClientFactory {
    /// No clusters yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The driver of `cluster_id`, if a client was ever built for it.
    pub fn driver(&self, cluster_id: &str) -> Option<MemoryDriver> {
        self.drivers.get(cluster_id).map(|driver| driver.clone())
    }
}

impl ClientFactory for MemoryClientFactory {
    type Client = ArakoonClient<MemoryDriver>;

    fn build(&self, config: &ClusterConfig) -> Self::Client {
        let driver = self
            .drivers
            .entry(config.cluster_id.clone())
            .or_insert_with(|| MemoryDriver::new(config.cluster_id.clone()))
            .clone();
        ArakoonClient::new(ClientConfig::new(config.cluster_id.clone()), driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_file_tree() {
        let host = MockHost::new("10.0.0.1", "m1");
        let client = host.client("root");

        client.file_write("/data/db/a", "1").await.unwrap();
        client.file_write("/data/db/sub/b", "2").await.unwrap();
        client.file_write("/data/dbx", "3").await.unwrap();

        assert!(client.dir_exists("/data/db/").await.unwrap());
        assert_eq!(
            client.file_list("/data/db", true).await.unwrap(),
            vec!["/data/db/a", "/data/db/sub/b"]
        );
        assert_eq!(client.file_list("/data/db", false).await.unwrap(), vec!["/data/db/a"]);

        client.dir_delete(&["/data/db".to_string()]).await.unwrap();
        assert!(!client.dir_exists("/data/db/sub").await.unwrap());
        assert_eq!(host.file("/data/dbx").as_deref(), Some("3"));
        assert_eq!(machine_id(&client).await.unwrap(), "m1");
    }
}
