//! Typed errors for each subsystem.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerStoreError {
    #[error("failed to open node map file [{path}] for writing: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize node map: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize node map file [{path}]: {source}")]
    Deserialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster API call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("node [{0}] not found")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to parse response: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("netlink request failed: {0}")]
    Netlink(String),
    #[error("link [{0}] not found")]
    LinkNotFound(String),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to parse subnet [{subnet}]: {reason}")]
    InvalidSubnet { subnet: String, reason: String },
    #[error("node has no IPv6 internal address")]
    NoIpv6Address,
}

#[derive(Debug, Error)]
pub enum NatError {
    #[error("failed to set up nat chain [{chain}] in table [{table}]: {reason}")]
    Setup {
        table: String,
        chain: String,
        reason: String,
    },
    #[error("subnet [{0}] is neither ipv4 nor ipv6")]
    UnknownFamily(String),
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("local node has no IPv6 address")]
    NoLocalEndpoint,
    #[error("local node has no pod subnets")]
    NoLocalSubnets,
    #[error("cluster client unreachable at startup: {0}")]
    ClusterUnreachable(#[source] ClusterError),
    #[error("failed to open initial node watch: {0}")]
    WatchFailed(#[source] ClusterError),
}
