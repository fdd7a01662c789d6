//! Cluster error types

use std::net::AddrParseError;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster-specific error types
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("No hosts available for service '{0}'")]
    NoHostsAvailable(String),

    #[error("Membership snapshot v{version} is stale: last update {age_ms}ms ago")]
    StaleRegistry { version: u64, age_ms: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Membership service already started")]
    AlreadyStarted,

    #[error("Membership service not started")]
    NotStarted,

    #[error("Failed to see {expected} backends, last membership size observed was: {observed}")]
    BootstrapTimeout { expected: usize, observed: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] AddrParseError),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl ClusterError {
    pub fn connectivity<T: Into<String>>(msg: T) -> Self {
        Self::Connectivity(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn no_hosts_available<T: Into<String>>(service_id: T) -> Self {
        Self::NoHostsAvailable(service_id.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_address<T: Into<String>>(msg: T) -> Self {
        Self::InvalidAddress(msg.into())
    }

    pub fn registration_rejected<T: Into<String>>(msg: T) -> Self {
        Self::RegistrationRejected(msg.into())
    }

    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn bootstrap_timeout(expected: usize, observed: usize) -> Self {
        Self::BootstrapTimeout { expected, observed }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Timeout(_) | Self::Io(_))
    }
}

impl From<tonic::Status> for ClusterError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable | tonic::Code::Unknown => {
                Self::connectivity(format!("gRPC error: {}", status.message()))
            }
            tonic::Code::DeadlineExceeded | tonic::Code::Cancelled => {
                Self::timeout(format!("gRPC deadline: {}", status.message()))
            }
            tonic::Code::InvalidArgument => Self::invalid_address(status.message().to_string()),
            _ => Self::protocol(format!("gRPC error: {}", status)),
        }
    }
}

impl From<tonic::transport::Error> for ClusterError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::connectivity(format!("transport error: {}", err))
    }
}

impl From<config::ConfigError> for ClusterError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}
