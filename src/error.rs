use crate::persist::ServerAddress;
use std::io;

/// ClientError is the error surface of the client front-end. Every variant
/// maps to one response kind from the consensus loop, plus `Timeout` for a
/// local wait expiry and `Closed` for a torn-down backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,

    #[error("request failed")]
    Failure,

    #[error("no leader is currently known")]
    LeaderUnknown,

    #[error("leader has not finished syncing its term")]
    LeaderUnsync,

    #[error("a membership change is already in flight")]
    InMemberChange,

    #[error("persistent store failure, node is shutting down")]
    PersistError,

    #[error("redirected to leader {0}")]
    LeaderRedirect(ServerAddress),

    #[error("protocol violation: unexpected response type")]
    InvalidResponseType,

    #[error("backend is closed")]
    Closed,
}

/// Payload-free discriminant of [`ClientError`], used by retry policies to
/// match against a retryable-error allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientErrorKind {
    Timeout,
    Failure,
    LeaderUnknown,
    LeaderUnsync,
    InMemberChange,
    PersistError,
    LeaderRedirect,
    InvalidResponseType,
    Closed,
}

impl ClientError {
    pub fn kind(&self) -> ClientErrorKind {
        match self {
            ClientError::Timeout => ClientErrorKind::Timeout,
            ClientError::Failure => ClientErrorKind::Failure,
            ClientError::LeaderUnknown => ClientErrorKind::LeaderUnknown,
            ClientError::LeaderUnsync => ClientErrorKind::LeaderUnsync,
            ClientError::InMemberChange => ClientErrorKind::InMemberChange,
            ClientError::PersistError => ClientErrorKind::PersistError,
            ClientError::LeaderRedirect(_) => ClientErrorKind::LeaderRedirect,
            ClientError::InvalidResponseType => ClientErrorKind::InvalidResponseType,
            ClientError::Closed => ClientErrorKind::Closed,
        }
    }
}

/// StoreError is returned by the pluggable persistence interfaces (log,
/// config manager, snapshot store, host state machine). Any store error
/// observed by the consensus loop is fatal for the node.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error")]
    Io(#[from] io::Error),

    #[error("store corrupted: {0}")]
    Corrupted(String),

    #[error("index {index} outside log range [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no server reachable at {0}")]
    Unreachable(ServerAddress),

    #[error("transport closed")]
    Closed,
}

/// NodeError covers node assembly and startup failures.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),

    #[error("startup integrity check failed")]
    Store(#[from] StoreError),

    #[error("local address {0} missing from the seed configuration")]
    NotInCluster(ServerAddress),
}
