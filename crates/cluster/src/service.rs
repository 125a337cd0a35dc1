//! Operating system services running the cluster nodes.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::time::Duration;

use async_trait::async_trait;
use ovs_arakoon_client::KeyValueClient;
use ovs_configuration::Configuration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument};

use crate::node::NodeClient;
use crate::system::machine_id;
use crate::Error;

/// Prefix shared by the framework's own services.
pub const SERVICE_PREFIX: &str = "ovs-";

/// Where unit files are installed.
pub const SYSTEMD_SERVICE_DIR: &str = "/lib/systemd/system";

/// Where unit templates are looked up.
pub const DEFAULT_TEMPLATE_DIR: &str = "/opt/OpenvStorage/config/templates/systemd";

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Parameters substituted into a service template and registered for the service.
pub type ServiceParams = BTreeMap<String, String>;

/// Drops the [`SERVICE_PREFIX`] from a service name.
#[must_use]
pub fn strip_service_prefix(name: &str) -> &str {
    name.strip_prefix(SERVICE_PREFIX).unwrap_or(name)
}

/// Configuration key holding the registered parameters of `service` on `node_id`.
#[must_use]
pub fn service_config_key(node_id: &str, service: &str) -> String {
    format!(
        "/ovs/framework/hosts/{node_id}/services/{}",
        strip_service_prefix(service)
    )
}

/// State reported by the service manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Running.
    Active,
    /// Stopped.
    Inactive,
    /// Stopped after a failure.
    Failed,
    /// Anything else, such as `activating`.
    Other(String),
}

impl ServiceStatus {
    /// Interprets the output of a status query.
    #[must_use]
    pub fn parse(output: &str) -> Self {
        match output.trim() {
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            "failed" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Inactive => f.write_str("inactive"),
            Self::Failed => f.write_str("failed"),
            Self::Other(status) => f.write_str(status),
        }
    }
}

/// A service to install from a template.
#[derive(Clone, Debug, Default)]
pub struct ServiceDefinition {
    /// Template name, such as `ovs-arakoon`.
    pub template: String,
    /// Values for the `<KEY>` placeholders of the template.
    pub params: ServiceParams,
    /// Name of the installed service, the template name when `None`.
    pub target_name: Option<String>,
    /// Service that must be started first.
    pub startup_dependency: Option<String>,
    /// Leave registering the parameters to the caller.
    pub delay_registration: bool,
}

/// Installs and drives services on a host.
#[async_trait]
pub trait ServiceManager: Debug + Send + Sync {
    /// Configuration key the parameters of `service` on `node_id` are registered under.
    fn service_config_key(&self, node_id: &str, service: &str) -> String {
        service_config_key(node_id, service)
    }

    /// Installs and enables a service, returning its parameters, or `None`
    /// when the template does not exist.
    async fn add_service(
        &self,
        client: &dyn NodeClient,
        definition: ServiceDefinition,
    ) -> Result<Option<ServiceParams>, Error>;

    /// Whether `name` (with or without [`SERVICE_PREFIX`]) is installed.
    async fn has_service(&self, name: &str, client: &dyn NodeClient) -> Result<bool, Error>;

    /// Current state of `name`.
    async fn get_service_status(&self, name: &str, client: &dyn NodeClient) -> Result<ServiceStatus, Error>;

    /// Starts `name` and waits up to `timeout` for it to become active.
    async fn start_service(&self, name: &str, client: &dyn NodeClient, timeout: Duration) -> Result<(), Error>;

    /// Stops `name` and waits up to `timeout` for it to become inactive.
    async fn stop_service(&self, name: &str, client: &dyn NodeClient, timeout: Duration) -> Result<(), Error>;

    /// Uninstalls `name`, un-registering it unless `delay_unregistration`.
    async fn remove_service(&self, name: &str, client: &dyn NodeClient, delay_unregistration: bool) -> Result<(), Error>;

    /// Records the parameters of a service installed on `node_id`.
    async fn register_service(&self, node_id: &str, params: &ServiceParams) -> Result<(), Error>;

    /// Forgets the parameters of `service_name` on `node_id`.
    async fn unregister_service(&self, node_id: &str, service_name: &str) -> Result<(), Error>;
}

/// [`ServiceManager`] driving `systemctl`, with registrations kept in the
/// configuration store.
#[derive(Clone)]
pub struct SystemdServiceManager<C: KeyValueClient> {
    configuration: Configuration<C>,
    template_dir: String,
}

impl<C: KeyValueClient> Debug for SystemdServiceManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemdServiceManager")
            .field("template_dir", &self.template_dir)
            .finish_non_exhaustive()
    }
}

impl<C: KeyValueClient> SystemdServiceManager<C> {
    /// Creates a manager using templates from [`DEFAULT_TEMPLATE_DIR`].
    pub fn new(configuration: Configuration<C>) -> Self {
        Self {
            configuration,
            template_dir: DEFAULT_TEMPLATE_DIR.to_string(),
        }
    }

    /// Looks templates up in `template_dir` instead.
    #[must_use]
    pub fn with_template_dir(mut self, template_dir: impl Into<String>) -> Self {
        self.template_dir = template_dir.into();
        self
    }

    fn unit_path(name: &str) -> String {
        format!("{SYSTEMD_SERVICE_DIR}/{name}.service")
    }

    /// Installed name of `name`: as given, or with the [`SERVICE_PREFIX`].
    async fn resolve(&self, name: &str, client: &dyn NodeClient) -> Result<Option<String>, Error> {
        let name = name.trim_end_matches('/');
        for candidate in [name.to_string(), format!("{SERVICE_PREFIX}{name}")] {
            if client.file_exists(&Self::unit_path(&candidate)).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn require(&self, name: &str, client: &dyn NodeClient) -> Result<String, Error> {
        self.resolve(name, client).await?.ok_or_else(|| {
            info!(service = %name, ip = %client.ip(), "service could not be found");
            Error::ServiceNotFound(name.to_string())
        })
    }

    async fn wait_for_status(
        &self,
        name: &str,
        client: &dyn NodeClient,
        status: ServiceStatus,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.get_service_status(name, client).await? == status {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ServiceTimeout {
                    service: name.to_string(),
                    ip: client.ip().to_string(),
                    state: status.to_string(),
                });
            }
            sleep(STATUS_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl<C: KeyValueClient> ServiceManager for SystemdServiceManager<C> {
    #[instrument(skip(self, client, definition), fields(ip = %client.ip(), template = %definition.template))]
    async fn add_service(
        &self,
        client: &dyn NodeClient,
        definition: ServiceDefinition,
    ) -> Result<Option<ServiceParams>, Error> {
        let template_file = format!("{}/{}.service", self.template_dir, definition.template);
        if !client.file_exists(&template_file).await? {
            debug!(template = %template_file, "no template, assuming a system init script");
            return Ok(None);
        }

        let service_name = definition.target_name.unwrap_or(definition.template);
        let mut params = definition.params;
        params.insert(
            "SERVICE_NAME".to_string(),
            strip_service_prefix(&service_name).to_string(),
        );
        params.insert(
            "STARTUP_DEPENDENCY".to_string(),
            definition
                .startup_dependency
                .map(|dependency| format!("{dependency}.service"))
                .unwrap_or_default(),
        );

        let mut unit = client.file_read(&template_file).await?;
        for (key, value) in &params {
            unit = unit.replace(&format!("<{key}>"), value);
        }
        client.file_write(&Self::unit_path(&service_name), &unit).await?;

        client.run(&["systemctl", "daemon-reload"]).await?;
        client
            .run(&["systemctl", "enable", &format!("{service_name}.service")])
            .await?;
        debug!(service = %service_name, "service added");

        if !definition.delay_registration {
            self.register_service(&machine_id(client).await?, &params).await?;
        }
        Ok(Some(params))
    }

    async fn has_service(&self, name: &str, client: &dyn NodeClient) -> Result<bool, Error> {
        Ok(self.resolve(name, client).await?.is_some())
    }

    async fn get_service_status(&self, name: &str, client: &dyn NodeClient) -> Result<ServiceStatus, Error> {
        let name = self.require(name, client).await?;
        let output = client.try_run(&["systemctl", "is-active", &name]).await?;
        Ok(ServiceStatus::parse(&output.stdout))
    }

    #[instrument(skip(self, client), fields(ip = %client.ip()))]
    async fn start_service(&self, name: &str, client: &dyn NodeClient, timeout: Duration) -> Result<(), Error> {
        if self.get_service_status(name, client).await? == ServiceStatus::Active {
            return Ok(());
        }

        // Unit files may have changed since the last start.
        client.try_run(&["systemctl", "daemon-reload"]).await?;
        let name = self.require(name, client).await?;
        client
            .run(&["systemctl", "start", &format!("{name}.service")])
            .await?;
        self.wait_for_status(&name, client, ServiceStatus::Active, timeout).await
    }

    #[instrument(skip(self, client), fields(ip = %client.ip()))]
    async fn stop_service(&self, name: &str, client: &dyn NodeClient, timeout: Duration) -> Result<(), Error> {
        if self.get_service_status(name, client).await? == ServiceStatus::Inactive {
            return Ok(());
        }

        let name = self.require(name, client).await?;
        client
            .run(&["systemctl", "stop", &format!("{name}.service")])
            .await?;
        self.wait_for_status(&name, client, ServiceStatus::Inactive, timeout).await
    }

    #[instrument(skip(self, client), fields(ip = %client.ip()))]
    async fn remove_service(&self, name: &str, client: &dyn NodeClient, delay_unregistration: bool) -> Result<(), Error> {
        let name = self.require(name, client).await?;
        // Already disabled is fine.
        client
            .try_run(&["systemctl", "disable", &format!("{name}.service")])
            .await?;
        client.file_delete(&[Self::unit_path(&name)]).await?;
        client.run(&["systemctl", "daemon-reload"]).await?;

        if !delay_unregistration {
            self.unregister_service(&machine_id(client).await?, &name).await?;
        }
        Ok(())
    }

    async fn register_service(&self, node_id: &str, params: &ServiceParams) -> Result<(), Error> {
        let service = params.get("SERVICE_NAME").map_or("", String::as_str);
        let key = self.service_config_key(node_id, service);
        self.configuration.set(&key, serde_json::to_value(params)?).await?;
        Ok(())
    }

    async fn unregister_service(&self, node_id: &str, service_name: &str) -> Result<(), Error> {
        let key = self.service_config_key(node_id, service_name);
        self.configuration.delete(&key, false).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CommandOutput;
    use crate::test_helpers::MockHost;
    use assert_matches::assert_matches;
    use ovs_arakoon_client::{ArakoonClient, ClientConfig};
    use ovs_arakoon_memory::MemoryDriver;
    use ovs_configuration::ArakoonConfiguration;
    use serde_json::json;

    type Client = ArakoonClient<MemoryDriver>;

    fn manager() -> SystemdServiceManager<Client> {
        let client = ArakoonClient::new(ClientConfig::new("config"), MemoryDriver::new("config"));
        SystemdServiceManager::new(Configuration::new(ArakoonConfiguration::new(client)))
    }

    fn host() -> MockHost {
        let host = MockHost::new("10.100.1.1", "machine1");
        host.write_file(
            &format!("{DEFAULT_TEMPLATE_DIR}/ovs-arakoon.service"),
            "ExecStart=arakoon --node <NODE_ID> -config <CONFIG_PATH>\nAfter=<STARTUP_DEPENDENCY>\n",
        );
        host
    }

    fn definition(delay_registration: bool) -> ServiceDefinition {
        ServiceDefinition {
            template: "ovs-arakoon".to_string(),
            params: ServiceParams::from([
                ("NODE_ID".to_string(), "machine1".to_string()),
                ("CONFIG_PATH".to_string(), "arakoon://config/ovs/arakoon/abm/config".to_string()),
            ]),
            target_name: Some("ovs-arakoon-abm".to_string()),
            startup_dependency: Some("ovs-watcher-config".to_string()),
            delay_registration,
        }
    }

    #[tokio::test]
    async fn test_add_service_renders_and_registers() {
        let manager = manager();
        let host = host();
        let client = host.client("root");

        let params = manager.add_service(&client, definition(false)).await.unwrap().unwrap();

        assert_eq!(params["SERVICE_NAME"], "arakoon-abm");
        assert_eq!(
            host.file("/lib/systemd/system/ovs-arakoon-abm.service").unwrap(),
            "ExecStart=arakoon --node machine1 -config arakoon://config/ovs/arakoon/abm/config\nAfter=ovs-watcher-config.service\n"
        );
        assert_eq!(
            host.commands(),
            vec!["systemctl daemon-reload", "systemctl enable ovs-arakoon-abm.service"]
        );

        let registered = manager
            .configuration
            .get("/ovs/framework/hosts/machine1/services/arakoon-abm")
            .await
            .unwrap();
        assert_eq!(registered["SERVICE_NAME"], json!("arakoon-abm"));
        assert!(manager.has_service("arakoon-abm", &client).await.unwrap());

        manager.remove_service("arakoon-abm", &client, false).await.unwrap();
        assert!(!manager.has_service("arakoon-abm", &client).await.unwrap());
        assert!(
            !manager
                .configuration
                .exists("/ovs/framework/hosts/machine1/services/arakoon-abm")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_add_service_without_template() {
        let manager = manager();
        let host = MockHost::new("10.100.1.1", "machine1");

        assert!(
            manager
                .add_service(&host.client("root"), definition(false))
                .await
                .unwrap()
                .is_none()
        );
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_start_waits_for_active() {
        let manager = manager();
        let host = host();
        let client = host.client("root");
        manager.add_service(&client, definition(true)).await.unwrap();
        host.respond("systemctl is-active ovs-arakoon-abm", CommandOutput::success("inactive\n"));
        host.respond("systemctl is-active ovs-arakoon-abm", CommandOutput::success("activating\n"));
        host.respond("systemctl is-active ovs-arakoon-abm", CommandOutput::success("active\n"));

        manager
            .start_service("arakoon-abm", &client, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(
            host.commands()
                .contains(&"systemctl start ovs-arakoon-abm.service".to_string())
        );
        assert_eq!(
            manager.get_service_status("arakoon-abm", &client).await.unwrap(),
            ServiceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_stop_times_out() {
        let manager = manager();
        let host = host();
        let client = host.client("root");
        manager.add_service(&client, definition(true)).await.unwrap();
        host.respond("systemctl is-active ovs-arakoon-abm", CommandOutput::success("active\n"));

        assert_matches!(
            manager
                .stop_service("ovs-arakoon-abm", &client, Duration::from_millis(300))
                .await,
            Err(Error::ServiceTimeout { state, .. }) if state == "inactive"
        );
        assert_matches!(
            manager.get_service_status("missing", &client).await,
            Err(Error::ServiceNotFound(name)) if name == "missing"
        );
    }
}
