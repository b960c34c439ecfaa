use std::time::Duration;

use thiserror::Error;

use crate::driver::protocol::types::Consistency;

/// Every failure the driver can surface to a caller.
///
/// Connection-level variants carry the address that failed so callers can
/// branch on kind without parsing messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    // Transport errors
    #[error("Host {address} unavailable: {reason}")]
    HostUnavailable { address: String, reason: String },

    #[error("No host available ({} attempted)", errors.len())]
    NoHostAvailable { errors: Vec<DriverError> },

    #[error("Connection to {address} broken: {reason}")]
    ConnectionBroken { address: String, reason: String },

    // Codec errors
    #[error("Value too large: {len} bytes exceeds maximum of {max}")]
    ValueTooLarge { len: usize, max: usize },

    #[error("Truncated data: needed {needed} bytes, {available} available")]
    TruncatedData { needed: usize, available: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported protocol version {attempted}: {message}")]
    UnsupportedProtocolVersion { attempted: u8, message: String },

    // Query-level errors
    #[error("Operation timed out after {timeout:?} on {address} (stream {stream})")]
    OperationTimedOut {
        address: String,
        stream: i16,
        timeout: Duration,
    },

    #[error("Read timeout at {consistency}: {received}/{block_for} responses, data present: {data_present}: {message}")]
    ReadTimeout {
        message: String,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },

    #[error("Read failure at {consistency}: {received}/{block_for} responses, {failures} failed: {message}")]
    ReadFailure {
        message: String,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        failures: i32,
        data_present: bool,
    },

    #[error("Write timeout at {consistency} ({write_type}): {received}/{block_for} acks: {message}")]
    WriteTimeout {
        message: String,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: String,
    },

    #[error("Write failure at {consistency} ({write_type}): {received}/{block_for} acks, {failures} failed: {message}")]
    WriteFailure {
        message: String,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        failures: i32,
        write_type: String,
    },

    // Schema rejections
    #[error("Already exists: {message}")]
    AlreadyExists {
        keyspace: String,
        table: String,
        message: String,
    },

    #[error("Configuration exception: {message}")]
    ConfigurationException { message: String },

    #[error("Server error {code:#06x} ({name}): {message}")]
    Server {
        code: u32,
        name: &'static str,
        message: String,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    // Client state
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session has been shut down")]
    SessionShutdown,

    #[error("Cluster has been shut down")]
    ClusterShutdown,
}

pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// Whether a caller may reasonably retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::OperationTimedOut { .. }
                | DriverError::ReadTimeout { .. }
                | DriverError::ReadFailure { .. }
                | DriverError::WriteTimeout { .. }
                | DriverError::WriteFailure { .. }
                | DriverError::HostUnavailable { .. }
                | DriverError::ConnectionBroken { .. }
        )
    }

    /// Whether the error leaves the connection that produced it unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, DriverError::ConnectionBroken { .. })
    }

    pub(crate) fn broken(address: &str, reason: impl std::fmt::Display) -> Self {
        DriverError::ConnectionBroken {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}
