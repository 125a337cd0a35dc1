use thiserror::Error;

/// Errors reported by an Arakoon driver.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// An assert inside a sequence (or a standalone assert) did not hold.
    #[error("assertion failed on key {0}")]
    AssertionFailed(String),

    /// The socket could not be read from.
    #[error("socket not readable: {0}")]
    SocketNotReadable(String),

    /// The socket read returned zero bytes.
    #[error("socket read returned no bytes: {0}")]
    SocketReadNoBytes(String),

    /// A request could not be sent.
    #[error("socket send failed: {0}")]
    SocketSendError(String),

    /// Any other socket failure.
    #[error("socket error: {0}")]
    Socket(String),

    /// The cluster has no elected master.
    #[error("no master found for cluster {0}")]
    NoMaster(String),

    /// The contacted node is not the master.
    #[error("node {0} is not the master")]
    NodeNotMaster(String),

    /// No connection could be established.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The node is shutting down.
    #[error("node going down: {0}")]
    GoingDown(String),

    /// The prefix is empty or made of `0xFF` bytes only.
    #[error("prefix {0:?} has no next prefix")]
    NoNextPrefix(Vec<u8>),

    /// A cluster configuration could not be parsed or converted.
    #[error("invalid cluster configuration: {0}")]
    Config(String),

    /// Any other driver failure.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Socket hiccups that warrant exactly one transparent retry.
    #[must_use]
    pub const fn is_transient_socket(&self) -> bool {
        matches!(
            self,
            Self::SocketNotReadable(_) | Self::SocketReadNoBytes(_) | Self::SocketSendError(_)
        )
    }

    /// Errors caused by a master (re-)election.
    #[must_use]
    pub const fn is_master_loss(&self) -> bool {
        matches!(
            self,
            Self::NoMaster(_) | Self::NodeNotMaster(_) | Self::NotConnected(_)
        )
    }

    /// Errors that are only safe to retry when the call did not mutate anything.
    #[must_use]
    pub const fn is_read_retriable(&self) -> bool {
        matches!(self, Self::Socket(_) | Self::GoingDown(_))
    }
}
