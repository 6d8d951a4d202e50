//! FleetGate Error Types

use thiserror::Error;

/// Result type alias for FleetGate operations
pub type Result<T> = std::result::Result<T, Error>;

/// FleetGate error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Cluster coordination errors
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Node index not found: {0}")]
    NodeIndexNotFound(u32),

    #[error("No leader available")]
    LeaderNotFound,

    #[error("Application is not prepared")]
    NotPrepared,

    #[error("Quorum not reached: {have}/{need}")]
    QuorumNotReached { have: usize, need: usize },

    // Device / driver errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Device already registered: {0}")]
    DuplicateDevice(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unknown connection scheme: {0}")]
    UnknownScheme(String),

    // Command / script errors
    #[error("Command compile error: {0}")]
    Compile(String),

    #[error("Script error: {0}")]
    Script(String),

    // Transport / protocol errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Response timeout for device {0}")]
    ResponseTimeout(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Transient peer errors are retried at a higher level (heartbeat,
    /// propagation fan-out, redirect) with backoff equal to one heartbeat interval.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PeerUnreachable(_)
                | Error::ConnectionTimeout(_)
                | Error::Network(_)
                | Error::Http(_)
        )
    }

    /// Membership-absence errors trigger election where appropriate.
    pub fn is_membership_absence(&self) -> bool {
        matches!(self, Error::NodeIndexNotFound(_) | Error::LeaderNotFound)
    }
}
