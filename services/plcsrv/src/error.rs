//! Error handling for the PLC service
//!
//! Every layer gets its own small error enum so callers can match on what
//! actually happened; [`PlcError`] aggregates them for the public surface.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by an [`S7Transport`](crate::transport::S7Transport) driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Driver timeout")]
    Timeout,

    #[error("Transport not connected")]
    NotConnected,
}

/// Establishing a session failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connect to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("Connect to {target} refused: {reason}")]
    Refused { target: String, reason: String },

    #[error("Giving up on {target} after {attempts} attempts: {last_error}")]
    Exhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Connect cancelled")]
    Cancelled,
}

/// A batched read failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Read cancelled")]
    Cancelled,

    #[error("Snapshot contained no values")]
    InvalidSnapshot,
}

impl ReadError {
    /// Whether this failure counts towards the consecutive-failure threshold
    ///
    /// `NotConnected` and `Cancelled` describe the session, not the device,
    /// and are handled by the reconnect path instead.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            ReadError::Transport(_) | ReadError::Timeout(_) | ReadError::InvalidSnapshot
        )
    }
}

/// A batched write failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Write cancelled")]
    Cancelled,

    #[error("Readback of {address} returned {actual}, expected {expected}")]
    VerificationFailed {
        address: String,
        expected: String,
        actual: String,
    },
}

/// A command was rejected before any PLC I/O
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Command carries no fields")]
    Empty,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} = {value} is outside 0..={max}")]
    OutOfRange {
        field: String,
        value: i64,
        max: i64,
    },

    #[error("Field {field} has no code {code}")]
    UnknownCode { field: String, code: i64 },

    #[error("Device {device} has no field {field}")]
    UnsupportedField { device: String, field: String },
}

/// Address catalog lookups and construction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Duplicate symbol: {0}")]
    DuplicateSymbol(String),

    #[error("Duplicate address {address} on device {device}")]
    DuplicateAddress { device: String, address: String },
}

/// PLC service error type
#[derive(Error, Debug, Clone)]
pub enum PlcError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device {device} unavailable: {reason}")]
    Unavailable { device: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the PLC service
pub type Result<T> = std::result::Result<T, PlcError>;

impl PlcError {
    pub fn config(msg: impl Into<String>) -> Self {
        PlcError::Config(msg.into())
    }

    pub fn unavailable(device: impl Into<String>, reason: impl Into<String>) -> Self {
        PlcError::Unavailable {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PlcError::Internal(msg.into())
    }

    /// True for both read and write `NotConnected`
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            PlcError::Read(ReadError::NotConnected) | PlcError::Write(WriteError::NotConnected)
        )
    }
}

impl From<figment::Error> for PlcError {
    fn from(err: figment::Error) -> Self {
        PlcError::Config(err.to_string())
    }
}

impl From<std::io::Error> for PlcError {
    fn from(err: std::io::Error) -> Self {
        PlcError::Internal(format!("IO error: {}", err))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert!(ReadError::Transport("reset".into()).counts_as_failure());
        assert!(ReadError::Timeout(Duration::from_secs(1)).counts_as_failure());
        assert!(ReadError::InvalidSnapshot.counts_as_failure());
        assert!(!ReadError::NotConnected.counts_as_failure());
        assert!(!ReadError::Cancelled.counts_as_failure());
    }

    #[test]
    fn test_not_connected_detection() {
        assert!(PlcError::from(WriteError::NotConnected).is_not_connected());
        assert!(PlcError::from(ReadError::NotConnected).is_not_connected());
        assert!(!PlcError::config("x").is_not_connected());
    }

    #[test]
    fn test_display_is_transparent() {
        let err = PlcError::from(CatalogError::UnknownSymbol("TLV9.MODO".into()));
        assert_eq!(err.to_string(), "Unknown symbol: TLV9.MODO");
    }
}
