//! Lifecycle management for Arakoon clusters: creating, extending, shrinking,
//! restarting and deleting clusters across hosts, and handing unused clusters
//! out to consumers.
//!
//! Hosts, services and cluster clients are reached through the
//! [`NodeConnector`], [`ServiceManager`] and [`ClientFactory`] seams, chosen
//! once and bundled in a [`ClusterContext`]. An [`ArakoonInstaller`] drives
//! one cluster with that context.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod context;
mod error;
mod factory;
mod installer;
mod metadata;
mod node;
mod service;
mod system;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use context::{
    CLAIM_LOCK, CLUSTER_NAMES_KEY, ClusterContext, DEFAULT_CLAIM_LOCK_WAIT, DEFAULT_FILESYSTEM_PORT,
    DEFAULT_PORT_LOCK_WAIT, DEFAULT_SERVICE_TIMEOUT, DEFAULT_SSH_USER, InstallerConfig, ROOT_USER,
    get_service_name_for_cluster, host_port_range_key, port_lock_name,
};
pub use error::Error;
pub use factory::{ClientFactory, DriverClientFactory};
pub use installer::{ArakoonInstaller, CONFIG_WATCHER_SERVICE, NodeRequest, SERVICE_TEMPLATE, home_dir, tlog_dir};
pub use metadata::{ClusterMetadata, ClusterType, INTERNAL_CONFIG_KEY, METADATA_KEY};
pub use node::{CommandOutput, LocalConnector, LocalNodeClient, NodeClient, NodeConnector};
pub use service::{
    DEFAULT_TEMPLATE_DIR, SERVICE_PREFIX, SYSTEMD_SERVICE_DIR, ServiceDefinition, ServiceManager, ServiceParams,
    ServiceStatus, SystemdServiceManager, service_config_key, strip_service_prefix,
};
pub use system::{
    EPHEMERAL_PORT_RANGE_FILE, MACHINE_ID_FILE, PortRange, ephemeral_port_range, get_free_ports, machine_id,
    ports_in_use, select_free_ports,
};
