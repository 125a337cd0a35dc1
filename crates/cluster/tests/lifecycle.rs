use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use ovs_arakoon::config::{config_file, config_key};
use ovs_arakoon::ClusterConfig;
use ovs_arakoon_client::{ArakoonClient, ClientConfig};
use ovs_arakoon_memory::MemoryDriver;
use ovs_cluster::test_helpers::{MemoryClientFactory, MockConnector, MockHost, MockServiceManager};
use ovs_cluster::{
    ArakoonInstaller, CLAIM_LOCK, CLUSTER_NAMES_KEY, ClusterContext, ClusterMetadata, ClusterType, CommandOutput,
    Error, INTERNAL_CONFIG_KEY, InstallerConfig, METADATA_KEY, NodeRequest, ServiceStatus, port_lock_name,
};
use ovs_configuration::{ArakoonConfiguration, Configuration};
use ovs_locks::{Lock, LockManager, LockStatus};
use ovs_locks_arakoon::{ArakoonLockManager, LockConfig};
use ovs_locks_memory::MemoryLockManager;
use serde_json::json;
use tracing_test::traced_test;

type Client = ArakoonClient<MemoryDriver>;

const HOSTS: [(&str, &str); 3] = [("10.0.0.1", "m1"), ("10.0.0.2", "m2"), ("10.0.0.3", "m3")];

struct Harness<L> {
    network: MockConnector,
    services: MockServiceManager,
    clients: MemoryClientFactory,
    configuration: Configuration<Client>,
    locks: L,
    context: ClusterContext<Client, MemoryClientFactory, L>,
}

impl<L: LockManager> Harness<L> {
    fn host(&self, ip: &str) -> MockHost {
        self.network.host(ip).unwrap()
    }

    fn installer(&self, cluster_name: &str) -> ArakoonInstaller<Client, MemoryClientFactory, L> {
        ArakoonInstaller::new(self.context.clone(), cluster_name)
    }

    fn driver(&self, cluster_name: &str) -> MemoryDriver {
        self.clients.driver(cluster_name).unwrap()
    }

    fn metadata(&self, cluster_name: &str) -> ClusterMetadata {
        serde_json::from_slice(&self.driver(cluster_name).snapshot()[METADATA_KEY]).unwrap()
    }

    async fn stored_config(&self, cluster_name: &str) -> ClusterConfig {
        let raw = self.configuration.get_raw(&config_key(cluster_name)).await.unwrap();
        ClusterConfig::from_ini(cluster_name, &String::from_utf8_lossy(&raw)).unwrap()
    }

    /// Creates a started, store-backed cluster on the first `size` hosts.
    async fn running_cluster(
        &self,
        cluster_name: &str,
        cluster_type: ClusterType,
        size: usize,
    ) -> ArakoonInstaller<Client, MemoryClientFactory, L> {
        let mut installer = self.installer(cluster_name);
        installer
            .create_cluster(cluster_type, false, request(HOSTS[0].0))
            .await
            .unwrap();
        installer.start_cluster().await.unwrap();
        for (ip, _) in &HOSTS[1..size] {
            installer.extend_cluster(request(ip)).await.unwrap();
            installer.restart_cluster_after_extending(ip).await.unwrap();
        }
        installer
    }
}

fn store() -> Client {
    ArakoonClient::new(ClientConfig::new("config"), MemoryDriver::new("config"))
}

async fn harness_with<L: LockManager>(store: Client, locks: L, settings: InstallerConfig) -> Harness<L> {
    let network = MockConnector::new();
    let services = MockServiceManager::new();
    let clients = MemoryClientFactory::new();
    let configuration = Configuration::new(ArakoonConfiguration::new(store));

    for (ip, machine_id) in HOSTS {
        network.add_host(ip, machine_id);
        configuration
            .set(
                &format!("/ovs/framework/hosts/{machine_id}/ports|arakoon"),
                json!([[26400, 26499]]),
            )
            .await
            .unwrap();
    }

    let context = ClusterContext::new(
        configuration.clone(),
        Arc::new(network.clone()),
        Arc::new(services.clone()),
        clients.clone(),
        locks.clone(),
        settings,
    );
    Harness {
        network,
        services,
        clients,
        configuration,
        locks,
        context,
    }
}

async fn harness() -> Harness<MemoryLockManager> {
    harness_with(store(), MemoryLockManager::new(), InstallerConfig::default()).await
}

fn request(ip: &str) -> NodeRequest {
    NodeRequest::new(
        ip,
        "/mnt/hdd1/",
        "/var/log/arakoon/arakoon.log",
        "/var/log/arakoon/crash.log",
    )
}

fn service_events(harness: &Harness<impl LockManager>, count: usize) -> Vec<String> {
    let events = harness.services.events();
    events[events.len().saturating_sub(count)..].to_vec()
}

#[tokio::test]
#[traced_test]
async fn test_create_and_start_cluster() {
    let h = harness().await;
    let mut installer = h.installer("abm");

    installer
        .create_cluster(ClusterType::Abm, false, request("10.0.0.1"))
        .await
        .unwrap();

    assert_eq!(installer.ports(), BTreeMap::from([("10.0.0.1".to_string(), [26400, 26401])]));
    assert_eq!(&h.stored_config("abm").await, installer.config().unwrap());
    assert!(!installer.is_filesystem());
    assert!(!installer.metadata().unwrap().in_use);

    let host = h.host("10.0.0.1");
    for directory in ["/mnt/hdd1/arakoon/abm/db", "/mnt/hdd1/arakoon/abm/tlogs", "/var/log/arakoon"] {
        assert!(host.has_dir(directory), "{directory}");
        assert_eq!(host.mode(directory), Some(0o755));
        assert_eq!(host.owner(directory).as_deref(), Some("ovs:ovs"));
    }

    let registrations = h.services.registrations();
    let params = &registrations["/ovs/framework/hosts/m1/services/arakoon-abm"];
    assert_eq!(params["CLUSTER"], "abm");
    assert_eq!(params["NODE_ID"], "m1");
    assert_eq!(params["CONFIG_PATH"], "arakoon://config/ovs/arakoon/abm/config");
    assert_eq!(params["EXTRA_VERSION_CMD"], "");
    assert_eq!(params["STARTUP_DEPENDENCY"], "ovs-watcher-config.service");
    assert_eq!(installer.service_metadata()["10.0.0.1"].as_ref(), Some(params));

    installer.start_cluster().await.unwrap();

    assert_eq!(
        h.services.events(),
        vec!["add ovs-arakoon-abm@10.0.0.1", "start ovs-arakoon-abm@10.0.0.1"]
    );
    let snapshot = h.driver("abm").snapshot();
    assert_eq!(snapshot[INTERNAL_CONFIG_KEY], installer.config().unwrap().export_ini());
    let metadata = h.metadata("abm");
    assert_eq!(metadata.cluster_type, ClusterType::Abm);
    assert!(metadata.in_use);
    assert!(!metadata.internal);
    assert!(h.context.is_running("abm", &host.client("root")).await.unwrap());
    assert_eq!(h.context.cluster_names().await.unwrap(), vec!["abm"]);
    assert!(logs_contain("creating cluster completed"));
}

#[tokio::test]
async fn test_create_existing_cluster_fails() {
    let h = harness().await;
    h.installer("abm")
        .create_cluster(ClusterType::Abm, false, request("10.0.0.1"))
        .await
        .unwrap();

    assert_matches!(
        h.installer("abm")
            .create_cluster(ClusterType::Abm, false, request("10.0.0.2"))
            .await,
        Err(Error::AlreadyExists(name)) if name == "abm"
    );
}

#[tokio::test]
async fn test_ports_avoid_other_clusters_on_the_host() {
    let h = harness().await;
    let mut first = h.installer("nsm_0");
    let mut second = h.installer("nsm_1");

    first
        .create_cluster(ClusterType::Nsm, false, request("10.0.0.1"))
        .await
        .unwrap();
    second
        .create_cluster(ClusterType::Nsm, false, request("10.0.0.1"))
        .await
        .unwrap();

    assert_eq!(second.ports()["10.0.0.1"], [26402, 26403]);

    let mut narrow = request("10.0.0.1");
    narrow.port_range = Some(vec![ovs_cluster::PortRange::Between(26400, 26404)]);
    assert_matches!(
        h.installer("nsm_2")
            .create_cluster(ClusterType::Nsm, false, narrow)
            .await,
        Err(Error::NoFreePorts { requested: 2, found }) if found == vec![26404]
    );
}

#[tokio::test]
async fn test_leftover_data_is_removed() {
    let h = harness().await;
    let host = h.host("10.0.0.1");
    host.write_file("/mnt/hdd1/arakoon/abm/tlogs/000.tlog", "old");

    h.installer("abm")
        .create_cluster(ClusterType::Abm, false, request("10.0.0.1"))
        .await
        .unwrap();

    assert_eq!(host.file("/mnt/hdd1/arakoon/abm/tlogs/000.tlog"), None);
    assert!(host.commands().contains(&"lsof /mnt/hdd1/arakoon/abm/tlogs/000.tlog".to_string()));
}

#[tokio::test]
async fn test_open_leftover_files_abort_creation() {
    let h = harness().await;
    let host = h.host("10.0.0.1");
    host.write_file("/mnt/hdd1/arakoon/abm/tlogs/000.tlog", "old");
    host.write_file("/mnt/hdd1/arakoon/abm/db/closed.db", "old");
    host.respond(
        "lsof /mnt/hdd1/arakoon/abm/tlogs/000.tlog",
        CommandOutput::success("arakoon 4242 ovs 5u REG 000.tlog\n"),
    );
    host.respond(
        "lsof /mnt/hdd1/arakoon/abm/db/closed.db",
        CommandOutput {
            status: Some(1),
            ..CommandOutput::default()
        },
    );

    let result = h
        .installer("abm")
        .create_cluster(ClusterType::Abm, false, request("10.0.0.1"))
        .await;

    assert_matches!(result, Err(Error::OpenFiles(files)) if files == vec![
        "Open file 000.tlog detected in directory /mnt/hdd1/arakoon/abm/tlogs".to_string()
    ]);
    assert_eq!(host.file("/mnt/hdd1/arakoon/abm/tlogs/000.tlog").as_deref(), Some("old"));
    assert_eq!(host.file("/mnt/hdd1/arakoon/abm/db/closed.db").as_deref(), Some("old"));
    assert!(!h.configuration.exists(&config_key("abm")).await.unwrap());
}

#[tokio::test]
async fn test_port_lock_serialises_installs_per_host() {
    let settings = InstallerConfig {
        port_lock_wait: Some(Duration::from_millis(50)),
        ..InstallerConfig::default()
    };
    let h = harness_with(store(), MemoryLockManager::new(), settings).await;
    let held = h.locks.peer().lock(&port_lock_name("10.0.0.1"), None, None);
    held.acquire(None).await.unwrap();

    assert_matches!(
        h.installer("abm")
            .create_cluster(ClusterType::Abm, false, request("10.0.0.1"))
            .await,
        Err(Error::LockTimeout { name, wait }) if name == port_lock_name("10.0.0.1")
            && wait == Duration::from_millis(50)
    );

    let mut unlocked = request("10.0.0.1");
    unlocked.locked = false;
    h.installer("nsm")
        .create_cluster(ClusterType::Nsm, false, unlocked)
        .await
        .unwrap();

    held.release().await.unwrap();
    h.installer("abm")
        .create_cluster(ClusterType::Abm, false, request("10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(
        h.locks.check(&port_lock_name("10.0.0.1")).await.unwrap(),
        LockStatus::Free
    );
}

#[tokio::test]
async fn test_plugins_must_match_when_extending() {
    let h = harness().await;
    let mut installer = h.installer("abm");
    let mut create = request("10.0.0.1");
    create.plugins = BTreeMap::from([("albamgr_plugin".to_string(), "alba version --terse".to_string())]);

    installer
        .create_cluster(ClusterType::Abm, false, create.clone())
        .await
        .unwrap();
    assert_eq!(installer.config().unwrap().plugins, vec!["albamgr_plugin"]);
    assert_eq!(
        h.services.registrations()["/ovs/framework/hosts/m1/services/arakoon-abm"]["EXTRA_VERSION_CMD"],
        "alba version --terse"
    );

    assert_matches!(
        installer.extend_cluster(request("10.0.0.2")).await,
        Err(Error::PluginMismatch(plugin)) if plugin == "albamgr_plugin"
    );

    create.ip = "10.0.0.2".to_string();
    installer.extend_cluster(create).await.unwrap();
    assert_eq!(installer.config().unwrap().nodes.len(), 2);
}

#[tokio::test]
async fn test_extend_and_restart() {
    let h = harness().await;
    let mut installer = h.running_cluster("abm", ClusterType::Abm, 1).await;

    installer.extend_cluster(request("10.0.0.2")).await.unwrap();

    assert_eq!(
        installer.ports(),
        BTreeMap::from([
            ("10.0.0.1".to_string(), [26400, 26401]),
            ("10.0.0.2".to_string(), [26400, 26401]),
        ])
    );
    assert_eq!(h.stored_config("abm").await.nodes.len(), 2);
    assert!(h.services.registrations().contains_key("/ovs/framework/hosts/m2/services/arakoon-abm"));

    installer.restart_cluster_after_extending("10.0.0.2").await.unwrap();

    assert!(h.host("10.0.0.2").commands().contains(
        &"arakoon --node m2 -config arakoon://config/ovs/arakoon/abm/config -catchup-only".to_string()
    ));
    assert_eq!(
        service_events(&h, 3),
        vec![
            "stop ovs-arakoon-abm@10.0.0.1",
            "start ovs-arakoon-abm@10.0.0.1",
            "start ovs-arakoon-abm@10.0.0.2",
        ]
    );
    let stored = String::from_utf8(h.driver("abm").snapshot()[INTERNAL_CONFIG_KEY].to_vec()).unwrap();
    assert!(stored.contains("[m2]"));

    let events = h.services.events().len();
    installer.restart_cluster_after_extending("10.0.0.2").await.unwrap();
    assert_eq!(h.services.events().len(), events);
}

#[tokio::test]
async fn test_rolling_restart_waits_for_quorum() {
    let h = harness().await;
    let installer = h.running_cluster("abm", ClusterType::Abm, 2).await;
    let driver = h.driver("abm");

    let calls = driver.calls();
    installer.restart_cluster().await.unwrap();
    assert_eq!(driver.calls() - calls, 3);
    assert_eq!(
        service_events(&h, 4),
        vec![
            "stop ovs-arakoon-abm@10.0.0.1",
            "start ovs-arakoon-abm@10.0.0.1",
            "stop ovs-arakoon-abm@10.0.0.2",
            "start ovs-arakoon-abm@10.0.0.2",
        ]
    );

    driver.fail_next(ovs_arakoon::Error::Other("cluster down".to_string()));
    assert_matches!(installer.restart_cluster().await, Err(Error::Client(_)));
    assert_eq!(
        service_events(&h, 2),
        vec!["stop ovs-arakoon-abm@10.0.0.1", "start ovs-arakoon-abm@10.0.0.1"]
    );

    installer
        .restart_node(&h.host("10.0.0.2").client("root"))
        .await
        .unwrap();
    assert_eq!(
        service_events(&h, 2),
        vec!["stop ovs-arakoon-abm@10.0.0.2", "start ovs-arakoon-abm@10.0.0.2"]
    );
}

#[tokio::test]
async fn test_shrink_cluster() {
    let h = harness().await;
    let mut installer = h.running_cluster("abm", ClusterType::Abm, 2).await;

    installer.shrink_cluster("10.0.0.2", &[]).await.unwrap();

    let host = h.host("10.0.0.2");
    assert!(!host.has_dir("/mnt/hdd1/arakoon/abm/db"));
    assert!(!host.has_dir("/var/log/arakoon"));
    assert!(!h.services.services().keys().any(|(ip, _)| ip == "10.0.0.2"));
    assert!(!h.services.registrations().contains_key("/ovs/framework/hosts/m2/services/arakoon-abm"));
    let stored = h.stored_config("abm").await;
    assert_eq!(stored.nodes.iter().map(|node| node.name.as_str()).collect::<Vec<_>>(), vec!["m1"]);

    installer.restart_cluster_after_shrinking().await.unwrap();
    assert_eq!(
        service_events(&h, 2),
        vec!["stop ovs-arakoon-abm@10.0.0.1", "start ovs-arakoon-abm@10.0.0.1"]
    );
    let stored = String::from_utf8(h.driver("abm").snapshot()[INTERNAL_CONFIG_KEY].to_vec()).unwrap();
    assert!(!stored.contains("[m2]"));

    assert_matches!(
        installer.shrink_cluster("10.0.0.9", &[]).await,
        Err(Error::NodeNotFound(ip, cluster)) if ip == "10.0.0.9" && cluster == "abm"
    );
}

#[tokio::test]
async fn test_shrink_offline_node_leaves_it_alone() {
    let h = harness().await;
    let mut installer = h.running_cluster("abm", ClusterType::Abm, 3).await;

    installer
        .shrink_cluster("10.0.0.3", &["10.0.0.3".to_string()])
        .await
        .unwrap();

    assert!(h.host("10.0.0.3").has_dir("/mnt/hdd1/arakoon/abm/db"));
    assert!(h.services.services().contains_key(&("10.0.0.3".to_string(), "ovs-arakoon-abm".to_string())));
    assert!(!h.services.registrations().contains_key("/ovs/framework/hosts/m3/services/arakoon-abm"));
    assert_eq!(installer.config().unwrap().nodes.len(), 2);
}

#[tokio::test]
#[traced_test]
async fn test_delete_cluster_continues_past_unreachable_nodes() {
    let h = harness().await;
    let mut installer = h.running_cluster("abm", ClusterType::Abm, 2).await;
    let unreachable = h.network.remove_host("10.0.0.2").unwrap();

    installer.delete_cluster().await.unwrap();

    assert!(h.context.cluster_names().await.unwrap().is_empty());
    assert!(!h.host("10.0.0.1").has_dir("/mnt/hdd1/arakoon/abm/db"));
    assert!(!h.services.services().keys().any(|(ip, _)| ip == "10.0.0.1"));
    assert!(h.services.registrations().is_empty());
    assert!(unreachable.has_dir("/mnt/hdd1/arakoon/abm/db"));
    assert!(logs_contain("destroying node failed"));
}

#[tokio::test]
async fn test_filesystem_cluster() {
    let h = harness().await;
    let mut installer = h.installer("cacc");

    installer
        .create_cluster(ClusterType::Cfg, true, request("10.0.0.1"))
        .await
        .unwrap();

    let host = h.host("10.0.0.1");
    let contents = host.file(&config_file("cacc")).unwrap();
    assert!(contents.contains("[global]"));
    assert!(installer.is_filesystem());
    assert_eq!(installer.ports()["10.0.0.1"], [26400, 26401]);
    assert!(!h.configuration.dir_exists("/ovs/arakoon/cacc").await.unwrap());
    assert!(h.services.registrations().is_empty());
    let params = installer.service_metadata()["10.0.0.1"].clone().unwrap();
    assert_eq!(params["STARTUP_DEPENDENCY"], "");
    assert_eq!(params["CONFIG_PATH"], config_file("cacc"));

    assert_matches!(
        h.installer("cacc")
            .create_cluster(ClusterType::Cfg, true, request("10.0.0.1"))
            .await,
        Err(Error::AlreadyExists(_))
    );

    let mut loaded = h.installer("cacc");
    loaded.load(Some("10.0.0.1")).await.unwrap();
    assert!(loaded.is_filesystem());
    assert_eq!(loaded.config().unwrap().nodes, installer.config().unwrap().nodes);

    assert_eq!(
        h.context
            .get_unused_arakoon_metadata_and_claim(ClusterType::Cfg, None)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_claim_unused_clusters() {
    let h = harness().await;
    for (name, internal) in [("nsm_0", false), ("nsm_1", true)] {
        let mut installer = h.installer(name);
        installer
            .create_cluster(ClusterType::Nsm, internal, request("10.0.0.1"))
            .await
            .unwrap();
        installer.start_cluster().await.unwrap();
        installer.unclaim_cluster().await.unwrap();
        assert!(!installer.metadata().unwrap().in_use);
    }

    let unused = h.context.get_unused_arakoon_clusters(ClusterType::Nsm).await.unwrap();
    assert_eq!(
        unused.iter().map(|metadata| metadata.cluster_name.as_str()).collect::<Vec<_>>(),
        vec!["nsm_0", "nsm_1"]
    );

    let claimed = h
        .context
        .get_unused_arakoon_metadata_and_claim(ClusterType::Nsm, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.cluster_name, "nsm_0");
    assert!(claimed.in_use);
    assert!(h.metadata("nsm_0").in_use);

    assert_eq!(
        h.context
            .get_unused_arakoon_metadata_and_claim(ClusterType::Nsm, None)
            .await
            .unwrap(),
        None
    );
    assert_eq!(h.context.get_unused_arakoon_clusters(ClusterType::Nsm).await.unwrap().len(), 1);
    assert_eq!(
        h.context
            .get_unused_arakoon_metadata_and_claim(ClusterType::Abm, None)
            .await
            .unwrap(),
        None
    );
    assert_eq!(h.locks.check(CLAIM_LOCK).await.unwrap(), LockStatus::Free);

    assert_matches!(
        h.context.get_unused_arakoon_clusters(ClusterType::Cfg).await,
        Err(Error::UnsupportedClusterType(kind, _)) if kind == "CFG"
    );
}

#[tokio::test]
async fn test_claim_named_cluster_with_store_locks() {
    let store = store();
    let locks = ArakoonLockManager::new(store.clone(), LockConfig::default());
    let h = harness_with(store, locks, InstallerConfig::default()).await;
    for name in ["abm_0", "abm_1"] {
        let mut installer = h.running_cluster(name, ClusterType::Abm, 1).await;
        installer.unclaim_cluster().await.unwrap();
    }

    let claimed = h
        .context
        .get_unused_arakoon_metadata_and_claim(ClusterType::Abm, Some("abm_1"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(claimed.cluster_name, "abm_1");
    assert!(
        !h.context
            .get_arakoon_metadata_by_cluster_name("abm_0", None)
            .await
            .unwrap()
            .in_use
    );
    assert_eq!(h.locks.check(CLAIM_LOCK).await.unwrap(), LockStatus::Free);
}

#[tokio::test]
async fn test_deploy_reuses_registered_service() {
    let h = harness().await;
    h.configuration
        .set(
            "/ovs/framework/hosts/m1/services/arakoon-abm",
            json!({"SERVICE_NAME": "arakoon-abm", "CLUSTER": "abm", "NODE_ID": "m1"}),
        )
        .await
        .unwrap();
    let mut installer = h.installer("abm");

    installer
        .create_cluster(ClusterType::Abm, false, request("10.0.0.1"))
        .await
        .unwrap();

    assert!(h.services.events().is_empty());
    assert_eq!(
        installer.service_metadata()["10.0.0.1"].as_ref().unwrap()["NODE_ID"],
        "m1"
    );
}

#[tokio::test]
async fn test_cluster_name_mapping() {
    let h = harness().await;
    h.configuration
        .set(CLUSTER_NAMES_KEY, json!({"ovsdb": "framework-db"}))
        .await
        .unwrap();

    assert_eq!(
        h.context.get_cluster_name("ovsdb").await.unwrap().as_deref(),
        Some("framework-db")
    );
    assert_eq!(h.context.get_cluster_name("voldrv").await.unwrap(), None);
    assert_eq!(h.context.get_cluster_name("abm").await.unwrap().as_deref(), Some("abm"));
}

#[tokio::test]
async fn test_service_status_follows_lifecycle() {
    let h = harness().await;
    let installer = h.running_cluster("abm", ClusterType::Abm, 1).await;
    let root = h.host("10.0.0.1").client("root");

    h.context.stop("abm", &root).await.unwrap();
    assert_eq!(
        h.services.services()[&("10.0.0.1".to_string(), "ovs-arakoon-abm".to_string())],
        ServiceStatus::Inactive
    );
    assert!(!h.context.is_running("abm", &root).await.unwrap());

    h.context.remove("abm", &root, false).await.unwrap();
    assert!(!h.context.is_running("abm", &root).await.unwrap());
    h.context.start("abm", &root).await.unwrap();
    assert!(installer.config().is_some());
}
