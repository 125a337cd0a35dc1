use thiserror::Error;

/// Errors returned while managing Arakoon clusters.
#[derive(Debug, Error)]
pub enum Error {
    /// A cluster with this name is already configured.
    #[error("an Arakoon cluster with name \"{0}\" already exists")]
    AlreadyExists(String),

    /// The cluster type is unknown or not allowed for the operation.
    #[error("cluster type {0} is not supported, choose from {1}")]
    UnsupportedClusterType(String, String),

    /// The operation needs a loaded configuration (or metadata) first.
    #[error("configuration of cluster {0} not yet loaded")]
    ConfigNotLoaded(String),

    /// Leftover data cannot be removed while files are held open.
    #[error("open files detected:\n - {}", .0.join("\n - "))]
    OpenFiles(Vec<String>),

    /// The new node does not provide every plugin the cluster uses.
    #[error("the plugins should be equal to all nodes, {0} is missing")]
    PluginMismatch(String),

    /// Not enough free ports in the requested ranges.
    #[error("unable to find {requested} free ports, found {found:?}")]
    NoFreePorts {
        /// Number of ports asked for.
        requested: usize,
        /// Ports that were available.
        found: Vec<u16>,
    },

    /// No cluster member has this IP or name.
    #[error("no node {0} in cluster {1}")]
    NodeNotFound(String, String),

    /// No connection could be made to a host.
    #[error("cannot reach {user}@{ip}")]
    Unreachable {
        /// Address of the host.
        ip: String,
        /// User the connection was made as.
        user: String,
    },

    /// A command exited unsuccessfully.
    #[error("command `{command}` failed with status {status:?}: {stderr}")]
    Command {
        /// The command line.
        command: String,
        /// Exit status, `None` when killed by a signal.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The service is not installed on the host.
    #[error("service {0} could not be found")]
    ServiceNotFound(String),

    /// The service did not reach the expected state in time.
    #[error("service {service} on {ip} did not become {state}")]
    ServiceTimeout {
        /// Service name.
        service: String,
        /// Host of the service.
        ip: String,
        /// Awaited state.
        state: String,
    },

    /// A value read from a host could not be interpreted.
    #[error("unexpected output from {ip}: {detail}")]
    UnexpectedOutput {
        /// Host that produced it.
        ip: String,
        /// What was wrong.
        detail: String,
    },

    /// Local file or process I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The cluster configuration is invalid.
    #[error(transparent)]
    Arakoon(#[from] ovs_arakoon::Error),

    /// The cluster itself failed.
    #[error(transparent)]
    Client(#[from] ovs_arakoon_client::Error),

    /// The configuration store failed.
    #[error(transparent)]
    Configuration(#[from] ovs_configuration::Error),

    /// Stored metadata is not valid JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Another party kept the lock for the whole wait.
    #[error("lock {name} still taken after {wait:?}")]
    LockTimeout {
        /// Lock name.
        name: String,
        /// Time allowed for the wait.
        wait: std::time::Duration,
    },

    /// A lock could not be taken or given back.
    #[error("lock failed: {0}")]
    Lock(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub(crate) fn lock(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Lock(Box::new(error))
    }
}
