use thiserror::Error;

use crate::identity::NodeId;
use crate::messages::RejectReason;

/// Errors returned by the public DHT API.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("key not found")]
    KeyNotFound,

    #[error("peer not found")]
    PeerNotFound,

    #[error("no nodes available")]
    NoNodes,

    #[error("dht already started")]
    AlreadyStarted,

    #[error("dht not started")]
    NotStarted,

    #[error("dht closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("request timed out")]
    Timeout,

    #[error("no known address for {0}")]
    NoKnownAddress(NodeId),

    #[error("request rejected by remote peer: {0}")]
    Rejected(RejectReason),

    #[error("network error: {0:#}")]
    Network(#[from] anyhow::Error),
}

pub type Result<T, E = DhtError> = std::result::Result<T, E>;
