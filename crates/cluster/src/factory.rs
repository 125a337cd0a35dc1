use std::fmt::{self, Debug};

use ovs_arakoon::{ClusterConfig, ClusterEndpoints, Driver};
use ovs_arakoon_client::{ArakoonClient, ClientConfig, KeyValueClient};

/// Builds clients for the clusters being managed.
pub trait ClientFactory: Debug + Send + Sync + 'static {
    /// The client type handed out.
    type Client: KeyValueClient;

    /// A client talking to every node of `config`.
    fn build(&self, config: &ClusterConfig) -> Self::Client;
}

/// [`ClientFactory`] connecting a driver to the endpoints of each cluster.
pub struct DriverClientFactory<F> {
    connect: F,
    client_config: ClientConfig,
}

impl<F> DriverClientFactory<F> {
    /// Uses `connect` for the driver and `client_config` (with its cluster id
    /// replaced) for the client settings.
    pub const fn new(connect: F, client_config: ClientConfig) -> Self {
        Self {
            connect,
            client_config,
        }
    }
}

impl<F> Debug for DriverClientFactory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverClientFactory")
            .field("client_config", &self.client_config)
            .finish_non_exhaustive()
    }
}

impl<D, F> ClientFactory for DriverClientFactory<F>
where
    D: Driver,
    F: Fn(ClusterEndpoints) -> D + Send + Sync + 'static,
{
    type Client = ArakoonClient<D>;

    fn build(&self, config: &ClusterConfig) -> Self::Client {
        let client_config = ClientConfig {
            cluster_id: config.cluster_id.clone(),
            ..self.client_config.clone()
        };
        ArakoonClient::new(client_config, (self.connect)(config.endpoints()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovs_arakoon::NodeConfig;
    use ovs_arakoon_memory::MemoryDriver;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_driver_sees_cluster_endpoints() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = DriverClientFactory::new(
            {
                let seen = Arc::clone(&seen);
                move |endpoints: ClusterEndpoints| {
                    seen.lock().unwrap().push(endpoints.clone());
                    MemoryDriver::new(endpoints.cluster_id)
                }
            },
            ClientConfig::new("ignored"),
        );
        let mut config = ClusterConfig::new("abm");
        let mut node = NodeConfig::new("m1", "10.0.0.1");
        node.client_port = 26400;
        config.nodes.push(node);

        let client = factory.build(&config);
        client.nop().await.unwrap();

        assert_eq!(client.cluster_id(), "abm");
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].nodes[0].client_port, 26400);
        assert_eq!(seen[0].nodes[0].ips, vec!["10.0.0.1"]);
    }
}
