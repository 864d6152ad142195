//! Error types for the Modbus node
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. Table and
//! codec failures are recovered where they happen: the server turns them into
//! exception frames via [`ModbusError::to_exception_code`], the client turns
//! them into [`crate::client::ClientEvent`] reports.

use thiserror::Error;

use crate::protocol::ExceptionCode;
use crate::table::Space;

/// Result alias used across the crate
pub type ModbusResult<T> = std::result::Result<T, ModbusError>;

/// Unified error type
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Table access beyond the configured capacity of a space
    #[error("{space} access out of range: address {address} + count {count} exceeds capacity {capacity}")]
    OutOfRange {
        space: Space,
        address: usize,
        count: usize,
        capacity: usize,
    },

    /// Argument rejected before any state was touched
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Not enough bytes buffered to decode a frame part
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// MBAP protocol identifier other than 0
    #[error("Invalid protocol ID: expected 0, got {protocol_id}")]
    InvalidProtocol { protocol_id: u16 },

    /// Protocol exception, either produced locally or received from a peer
    #[error("Modbus exception: function 0x{function:02X}, {code}")]
    Exception { function: u8, code: ExceptionCode },

    /// Function code this node does not implement
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Malformed payload contents
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Connection-level failure
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Underlying socket I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation did not complete in time
    #[error("Timeout: {message} (after {timeout_ms}ms)")]
    Timeout { message: String, timeout_ms: u64 },

    /// All 65536 transaction IDs are in flight
    #[error("No free transaction ID: all identifiers are pending")]
    NoFreeTransactionId,

    /// Internal invariant failure (poisoned lock, task join error)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            timeout_ms,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map a local failure to the exception code sent back to the peer.
    pub fn to_exception_code(&self) -> ExceptionCode {
        match self {
            Self::OutOfRange { .. } => ExceptionCode::IllegalDataAddress,
            Self::InvalidData { .. } | Self::Truncated { .. } | Self::InvalidArgument { .. } => {
                ExceptionCode::IllegalDataValue
            }
            Self::InvalidFunction { .. } => ExceptionCode::IllegalFunction,
            Self::Exception { code, .. } => *code,
            _ => ExceptionCode::ServerDeviceFailure,
        }
    }

    /// Whether the connection should be torn down after this error
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Connection { .. })
    }
}
