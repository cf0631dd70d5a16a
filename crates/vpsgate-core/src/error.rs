use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    #[error("IP {0} is outside the DHCP pool")]
    IpOutOfPool(Ipv4Addr),

    #[error("IP {ip} is already allocated to {vps_id}")]
    IpAlreadyAllocated { ip: Ipv4Addr, vps_id: String },

    #[error("DHCP pool exhausted")]
    PoolExhausted,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IP mismatch: allocation holds {held}, caller supplied {given}")]
    IpMismatch { held: Ipv4Addr, given: Ipv4Addr },

    #[error("transient io failure: {0}")]
    TransientIo(String),

    #[error("control stream broken: {0}")]
    StreamBroken(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("delegation chain refused for source API {0}")]
    DelegationChain(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable kind name, carried in RPC error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigFatal",
            Error::InvalidInput(_) => "InvalidInput",
            Error::InvalidIp(_) => "InvalidIP",
            Error::IpOutOfPool(_) => "IPOutOfPool",
            Error::IpAlreadyAllocated { .. } => "IPAlreadyAllocated",
            Error::PoolExhausted => "PoolExhausted",
            Error::NotFound(_) => "NotFound",
            Error::IpMismatch { .. } => "IPMismatch",
            Error::TransientIo(_) => "TransientIO",
            Error::StreamBroken(_) => "StreamBroken",
            Error::UpstreamUnavailable(_) => "UpstreamUnavailable",
            Error::DelegationChain(_) => "DelegationChain",
            Error::Store(_) => "StoreError",
            Error::Serialization(_) => "SerializationError",
            Error::Io(_) => "IOError",
        }
    }
}

// Blanket From impls for redb error types
impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Store(e.to_string())
    }
}
