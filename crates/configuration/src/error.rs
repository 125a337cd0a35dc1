use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by the configuration layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The key, or a JSON path inside its document, does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Prefix deletes cannot be staged in a transaction.
    #[error("deleting {0} recursively within a transaction is not possible")]
    RecursiveDeleteInTransaction(String),

    /// The JSON path addresses into something that is not an object.
    #[error("invalid path {0}")]
    InvalidPath(String),

    /// A stored value is not valid JSON, or a value could not be encoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The key/value store failed.
    #[error(transparent)]
    Client(#[from] ovs_arakoon_client::Error),

    /// A lock operation failed.
    #[error(transparent)]
    Lock(#[from] ovs_locks_arakoon::Error),

    /// The client configuration file could not be read.
    #[error("could not read client configuration {path}: {source}")]
    Cacc {
        /// Location of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The client configuration file is malformed.
    #[error(transparent)]
    Arakoon(#[from] ovs_arakoon::Error),
}

impl Error {
    /// Whether the error means a key or path was absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Client(error) => error.is_not_found(),
            _ => false,
        }
    }
}
