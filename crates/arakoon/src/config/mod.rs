//! Cluster and node configuration, in the INI layout Arakoon itself reads.

mod ini;

pub use ini::IniDocument;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Root of all cluster configurations in the configuration store.
pub const CONFIG_ROOT: &str = "/ovs/arakoon";

/// Default value of the `tlog_max_entries` global for new clusters.
pub const DEFAULT_TLOG_MAX_ENTRIES: &str = "5000";

/// Default node log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default tlog compression.
pub const DEFAULT_TLOG_COMPRESSION: &str = "snappy";

pub(crate) const GLOBAL_SECTION: &str = "global";

/// Configuration store key holding the INI of a store-backed cluster.
#[must_use]
pub fn config_key(cluster_id: &str) -> String {
    format!("{CONFIG_ROOT}/{cluster_id}/config")
}

/// Filesystem path holding the INI of a filesystem-backed cluster.
#[must_use]
pub fn config_file(cluster_id: &str) -> String {
    format!("/opt/OpenvStorage/config/arakoon_{cluster_id}.ini")
}

/// Settings of one cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, also the INI section name.
    pub name: String,
    /// Address the node listens on.
    pub ip: String,
    /// Port for client traffic.
    pub client_port: u16,
    /// Port for node-to-node traffic.
    pub messaging_port: u16,
    /// Database directory.
    pub home: String,
    /// Transaction log directory.
    pub tlog_dir: String,
    /// Log sink URI or path.
    pub log_sinks: String,
    /// Crash log sink URI or path.
    pub crash_log_sinks: String,
    /// Whether the node should be preferred during master election.
    pub preferred_master: bool,
    /// Whether tlogs are fsync'ed.
    pub fsync: bool,
    /// Log level.
    pub log_level: String,
    /// Compression used for tlogs.
    pub tlog_compression: String,
}

impl NodeConfig {
    /// Creates a node with default settings and no ports or directories.
    #[must_use]
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            client_port: 0,
            messaging_port: 0,
            home: String::new(),
            tlog_dir: String::new(),
            log_sinks: String::new(),
            crash_log_sinks: String::new(),
            preferred_master: false,
            fsync: true,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            tlog_compression: DEFAULT_TLOG_COMPRESSION.to_string(),
        }
    }

    /// Directories owned by this node: tlogs, home and the parents of absolute log sinks.
    #[must_use]
    pub fn directories(&self) -> Vec<String> {
        let mut paths = vec![self.tlog_dir.clone(), self.home.clone()];
        for sink in [&self.log_sinks, &self.crash_log_sinks] {
            if sink.starts_with('/') {
                if let Some(parent) = std::path::Path::new(sink).parent() {
                    paths.push(parent.to_string_lossy().into_owned());
                }
            }
        }
        paths.sort();
        paths.dedup();
        paths
    }

    fn from_section(document: &IniDocument, name: &str, preferred: &[String]) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
            ip: document.require(name, "ip")?.to_string(),
            client_port: document.require_port(name, "client_port")?,
            messaging_port: document.require_port(name, "messaging_port")?,
            home: document.require(name, "home")?.to_string(),
            tlog_dir: document.require(name, "tlog_dir")?.to_string(),
            log_sinks: document.require(name, "log_sinks")?.to_string(),
            crash_log_sinks: document.require(name, "crash_log_sinks")?.to_string(),
            preferred_master: preferred.iter().any(|master| master == name),
            fsync: document.require_bool(name, "fsync")?,
            log_level: document.require(name, "log_level")?.to_string(),
            tlog_compression: document.require(name, "tlog_compression")?.to_string(),
        })
    }
}

/// A configuration value in dictionary form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Port numbers.
    Integer(i64),
    /// Everything else.
    Text(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u16> for ConfigValue {
    fn from(value: u16) -> Self {
        Self::Integer(i64::from(value))
    }
}

/// Section name to option name to value.
pub type ConfigDict = BTreeMap<String, BTreeMap<String, ConfigValue>>;

/// Target representation for [`ClusterConfig::convert_config_to`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    /// Nested dictionary.
    Dict,
    /// INI text.
    Ini,
}

/// A cluster configuration in either representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigRepr {
    /// Nested dictionary.
    Dict(ConfigDict),
    /// INI text.
    Ini(String),
}

/// Full configuration of one Arakoon cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Cluster identifier.
    pub cluster_id: String,
    /// Members, in insertion order.
    pub nodes: Vec<NodeConfig>,
    /// Plugins loaded by every node.
    pub plugins: Vec<String>,
    /// Global options without a dedicated field.
    pub extra_globals: BTreeMap<String, String>,
    /// Host holding the configuration file for filesystem-backed clusters.
    pub source_ip: Option<String>,
}

impl ClusterConfig {
    /// Creates an empty store-backed configuration with default globals.
    #[must_use]
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            nodes: Vec::new(),
            plugins: Vec::new(),
            extra_globals: BTreeMap::from([(
                "tlog_max_entries".to_string(),
                DEFAULT_TLOG_MAX_ENTRIES.to_string(),
            )]),
            source_ip: None,
        }
    }

    /// Creates an empty configuration stored as a file on `source_ip`.
    #[must_use]
    pub fn on_filesystem(cluster_id: impl Into<String>, source_ip: impl Into<String>) -> Self {
        Self {
            source_ip: Some(source_ip.into()),
            ..Self::new(cluster_id)
        }
    }

    /// Whether the configuration lives on a node's filesystem rather than in the store.
    #[must_use]
    pub const fn is_filesystem(&self) -> bool {
        self.source_ip.is_some()
    }

    /// Location of the INI: a store key, or a file path for filesystem clusters.
    #[must_use]
    pub fn internal_config_path(&self) -> String {
        if self.is_filesystem() {
            config_file(&self.cluster_id)
        } else {
            config_key(&self.cluster_id)
        }
    }

    /// Replaces nodes, plugins and globals with the contents of an INI document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] (mentioning the cluster) if the document is
    /// malformed or a node section is incomplete.
    pub fn read_ini(&mut self, contents: &str) -> Result<(), Error> {
        let cluster_id = self.cluster_id.clone();
        self.read_document(&IniDocument::parse(contents)?)
            .map_err(|error| Error::Config(format!("{error} on {cluster_id}")))
    }

    fn read_document(&mut self, document: &IniDocument) -> Result<(), Error> {
        let mut extra_globals = BTreeMap::new();
        let mut preferred = Vec::new();
        let mut plugins = self.plugins.clone();
        let mut cluster_id = self.cluster_id.clone();

        for (option, value) in document.options(GLOBAL_SECTION) {
            match option {
                "plugins" => {
                    plugins = value.split(',').map(|plugin| plugin.trim().to_string()).collect();
                }
                "cluster_id" => cluster_id = value.to_string(),
                "cluster" => {}
                "preferred_masters" => {
                    preferred = value.split(',').map(str::to_string).collect();
                }
                _ => {
                    extra_globals.insert(option.to_string(), value.to_string());
                }
            }
        }

        let nodes = document
            .require(GLOBAL_SECTION, "cluster")?
            .split(',')
            .map(str::trim)
            .map(|name| NodeConfig::from_section(document, name, &preferred))
            .collect::<Result<Vec<_>, _>>()?;

        self.cluster_id = cluster_id;
        self.plugins = plugins;
        self.extra_globals = extra_globals;
        self.nodes = nodes;
        Ok(())
    }

    /// Builds a configuration from INI contents.
    ///
    /// # Errors
    ///
    /// See [`ClusterConfig::read_ini`].
    pub fn from_ini(cluster_id: impl Into<String>, contents: &str) -> Result<Self, Error> {
        let mut config = Self::new(cluster_id);
        config.read_ini(contents)?;
        Ok(config)
    }

    /// Exports the configuration as a nested dictionary.
    #[must_use]
    pub fn export_dict(&self) -> ConfigDict {
        let mut names: Vec<&str> = self.nodes.iter().map(|node| node.name.as_str()).collect();
        names.sort_unstable();

        let mut global = BTreeMap::new();
        global.insert("cluster_id".to_string(), self.cluster_id.as_str().into());
        global.insert("cluster".to_string(), names.join(",").into());
        if !self.plugins.is_empty() {
            let mut plugins = self.plugins.clone();
            plugins.sort();
            global.insert("plugins".to_string(), plugins.join(",").into());
        }
        let preferred: Vec<&str> = self
            .nodes
            .iter()
            .filter(|node| node.preferred_master)
            .map(|node| node.name.as_str())
            .collect();
        if !preferred.is_empty() {
            global.insert("preferred_masters".to_string(), preferred.join(",").into());
        }
        for (option, value) in &self.extra_globals {
            global.insert(option.clone(), value.as_str().into());
        }

        let mut data = ConfigDict::new();
        data.insert(GLOBAL_SECTION.to_string(), global);
        for node in &self.nodes {
            data.insert(
                node.name.clone(),
                BTreeMap::from([
                    ("ip".to_string(), node.ip.as_str().into()),
                    ("home".to_string(), node.home.as_str().into()),
                    ("name".to_string(), node.name.as_str().into()),
                    ("fsync".to_string(), (if node.fsync { "true" } else { "false" }).into()),
                    ("tlog_dir".to_string(), node.tlog_dir.as_str().into()),
                    ("log_level".to_string(), node.log_level.as_str().into()),
                    ("log_sinks".to_string(), node.log_sinks.as_str().into()),
                    ("client_port".to_string(), node.client_port.into()),
                    ("messaging_port".to_string(), node.messaging_port.into()),
                    ("crash_log_sinks".to_string(), node.crash_log_sinks.as_str().into()),
                    ("tlog_compression".to_string(), node.tlog_compression.as_str().into()),
                ]),
            );
        }
        data
    }

    /// Exports the configuration as INI text: `global` first, then nodes sorted by name.
    #[must_use]
    pub fn export_ini(&self) -> String {
        dict_to_document(&self.export_dict()).render()
    }

    /// Replaces the configuration with `config` without changing its set of sections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if sections would be added or removed, if a
    /// node section's `name` differs from the section, or if a value is invalid.
    pub fn import_config(&mut self, config: ConfigRepr) -> Result<(), Error> {
        let ConfigRepr::Dict(dict) = Self::convert_config_to(config, ConfigFormat::Dict)? else {
            return Err(Error::Config("conversion to a dictionary failed".to_string()));
        };

        let mut old_sections: Vec<&str> = self.nodes.iter().map(|node| node.name.as_str()).collect();
        old_sections.push(GLOBAL_SECTION);
        old_sections.sort_unstable();
        let new_sections: Vec<&str> = dict.keys().map(String::as_str).collect();
        if old_sections != new_sections {
            return Err(Error::Config(
                "To add/remove sections, please use extend_cluster/shrink_cluster".to_string(),
            ));
        }

        for (section, options) in &dict {
            if section == GLOBAL_SECTION {
                continue;
            }
            if options.get("name").map(ToString::to_string).as_deref() != Some(section.as_str()) {
                return Err(Error::Config("Names cannot be updated".to_string()));
            }
        }

        let document = dict_to_document(&dict);
        let mut imported = self.clone();
        imported.read_document(&document)?;
        *self = imported;
        Ok(())
    }

    /// Converts a configuration between dictionary and INI form.
    ///
    /// Ports become integers when parsing INI; everything else stays text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unparsable INI or non-numeric ports.
    pub fn convert_config_to(config: ConfigRepr, format: ConfigFormat) -> Result<ConfigRepr, Error> {
        match (config, format) {
            (config @ ConfigRepr::Dict(_), ConfigFormat::Dict)
            | (config @ ConfigRepr::Ini(_), ConfigFormat::Ini) => Ok(config),
            (ConfigRepr::Dict(dict), ConfigFormat::Ini) => {
                Ok(ConfigRepr::Ini(dict_to_document(&dict).render()))
            }
            (ConfigRepr::Ini(contents), ConfigFormat::Dict) => {
                let document = IniDocument::parse(&contents)?;
                let mut dict = ConfigDict::new();
                for section in document.sections() {
                    let mut options = BTreeMap::new();
                    for (option, value) in document.options(section) {
                        let value = if matches!(option, "client_port" | "messaging_port") {
                            ConfigValue::Integer(i64::from(document.require_port(section, option)?))
                        } else {
                            ConfigValue::Text(value.to_string())
                        };
                        options.insert(option.to_string(), value);
                    }
                    dict.insert(section.to_string(), options);
                }
                Ok(ConfigRepr::Dict(dict))
            }
        }
    }

    /// Client ports and messaging ports per node IP.
    #[must_use]
    pub fn ports(&self) -> BTreeMap<String, [u16; 2]> {
        self.nodes
            .iter()
            .map(|node| (node.ip.clone(), [node.client_port, node.messaging_port]))
            .collect()
    }

    /// Looks up a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Client-side view of the cluster.
    #[must_use]
    pub fn endpoints(&self) -> ClusterEndpoints {
        ClusterEndpoints {
            cluster_id: self.cluster_id.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|node| NodeEndpoint {
                    name: node.name.clone(),
                    ips: vec![node.ip.clone()],
                    client_port: node.client_port,
                })
                .collect(),
        }
    }
}

fn dict_to_document(dict: &ConfigDict) -> IniDocument {
    let mut document = IniDocument::new();
    for (section, options) in dict {
        document.add_section(section.clone());
        for (option, value) in options {
            document.set(section, option.clone(), value.to_string());
        }
    }
    document
}

/// Where a client can reach one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEndpoint {
    /// Node name.
    pub name: String,
    /// Candidate addresses.
    pub ips: Vec<String>,
    /// Client port.
    pub client_port: u16,
}

/// What a client needs to connect to a cluster, usually read from a client config (cacc) file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEndpoints {
    /// Cluster identifier.
    pub cluster_id: String,
    /// Members of the cluster.
    pub nodes: Vec<NodeEndpoint>,
}

impl ClusterEndpoints {
    /// Parses a client configuration file.
    ///
    /// Only `global.cluster_id`, `global.cluster` and each node's `ip` and
    /// `client_port` are required.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any of those is missing.
    pub fn from_ini(contents: &str) -> Result<Self, Error> {
        let document = IniDocument::parse(contents)?;
        let cluster_id = document.require(GLOBAL_SECTION, "cluster_id")?.to_string();
        let nodes = document
            .require(GLOBAL_SECTION, "cluster")?
            .split(',')
            .map(str::trim)
            .map(|name| {
                Ok::<_, Error>(NodeEndpoint {
                    name: name.to_string(),
                    ips: document
                        .require(name, "ip")?
                        .split(',')
                        .map(|ip| ip.trim().to_string())
                        .collect(),
                    client_port: document.require_port(name, "client_port")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { cluster_id, nodes })
    }
}
