//! WolfVote Error Types

use thiserror::Error;

/// Result type alias for WolfVote operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfVote error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid address '{0}': expected host:port")]
    InvalidAddress(String),

    // Transport errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Request to {0} timed out")]
    RequestTimeout(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Wire serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Peer protocol errors
    #[error("Protocol violation from {address}: {detail}")]
    ProtocolViolation { address: String, detail: String },

    #[error("Voter is not registered with {0}")]
    NotRegistered(String),

    #[error("Not currently voting for {0}")]
    NotVoting(String),

    #[error("Registration with {address} rejected: {reason}")]
    RegistrationRejected { address: String, reason: String },

    // Facade errors
    #[error("Stripe '{0}' is already registered with this voter")]
    StripeAlreadyRegistered(String),

    #[error("Stripe '{0}' is not registered with this voter")]
    StripeNotRegistered(String),

    // Status errors
    #[error("Timed out waiting for registration")]
    RegistrationTimeout,

    #[error("Topology refresh failed: {0}")]
    Topology(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is a request or connect timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::RequestTimeout(_) | Error::ConnectionTimeout(_))
    }

    /// Check if this error is retryable on the next fixed-interval attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RequestTimeout(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::RegistrationRejected { .. }
        )
    }

    /// Check if this error means the peer must be treated as gone
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::RequestTimeout(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::NotConnected(_)
                | Error::Serialization(_)
                | Error::ProtocolViolation { .. }
                | Error::NotRegistered(_)
                | Error::Io(_)
        )
    }
}
