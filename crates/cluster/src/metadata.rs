use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use ovs_configuration::to_document;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Key inside every cluster holding its [`ClusterMetadata`].
pub const METADATA_KEY: &str = "__ovs_metadata";

/// Key inside every cluster holding the INI of its own configuration.
pub const INTERNAL_CONFIG_KEY: &str = "__ovs_config";

/// What a cluster is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterType {
    /// Backend manager.
    Abm,
    /// Framework model.
    Fwk,
    /// Namespace manager.
    Nsm,
    /// Storage driver.
    Sd,
    /// Configuration store; its configuration lives on the filesystem.
    Cfg,
}

impl ClusterType {
    /// Every type, in display order.
    pub const ALL: [Self; 5] = [Self::Abm, Self::Cfg, Self::Fwk, Self::Nsm, Self::Sd];

    /// Upper-case name as stored in metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Abm => "ABM",
            Self::Fwk => "FWK",
            Self::Nsm => "NSM",
            Self::Sd => "SD",
            Self::Cfg => "CFG",
        }
    }

    /// Whether clusters of this type keep their configuration in a file on
    /// their nodes instead of the configuration store.
    #[must_use]
    pub const fn is_filesystem(self) -> bool {
        matches!(self, Self::Cfg)
    }

    pub(crate) fn unsupported(name: &str, allowed: &[Self]) -> Error {
        let allowed: Vec<&str> = allowed.iter().map(|kind| kind.as_str()).collect();
        Error::UnsupportedClusterType(name.to_string(), allowed.join(", "))
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Self::unsupported(s, &Self::ALL))
    }
}

/// Ownership record stored under [`METADATA_KEY`] inside each cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Managed by the framework itself rather than handed out to a consumer.
    pub internal: bool,
    /// Name of the cluster.
    pub cluster_name: String,
    /// What the cluster is used for.
    pub cluster_type: ClusterType,
    /// Whether a consumer has claimed the cluster.
    pub in_use: bool,
}

impl ClusterMetadata {
    /// Whether a consumer looking for `cluster_type` may claim this cluster.
    #[must_use]
    pub fn is_claimable(&self, cluster_type: ClusterType) -> bool {
        self.cluster_type == cluster_type && !self.in_use && !self.internal
    }

    pub(crate) fn parse(value: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(value)?)
    }

    pub(crate) fn encode(&self) -> Result<Bytes, Error> {
        Ok(to_document(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_cluster_type_names() {
        assert_eq!("NSM".parse::<ClusterType>().unwrap(), ClusterType::Nsm);
        assert_eq!(ClusterType::Cfg.to_string(), "CFG");
        assert_matches!(
            "XYZ".parse::<ClusterType>(),
            Err(Error::UnsupportedClusterType(name, allowed)) if name == "XYZ" && allowed == "ABM, CFG, FWK, NSM, SD"
        );
    }

    #[test]
    fn test_metadata_document() {
        let metadata = ClusterMetadata {
            internal: false,
            cluster_name: "backend-abm".to_string(),
            cluster_type: ClusterType::Abm,
            in_use: false,
        };

        let encoded = metadata.encode().unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.contains("\n    \"cluster_type\": \"ABM\""));
        assert_eq!(ClusterMetadata::parse(&encoded).unwrap(), metadata);

        assert!(metadata.is_claimable(ClusterType::Abm));
        assert!(!metadata.is_claimable(ClusterType::Nsm));
        assert!(!ClusterMetadata { internal: true, ..metadata }.is_claimable(ClusterType::Abm));
    }
}
