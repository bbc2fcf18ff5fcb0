//! # Error Types
//!
//! Error handling for the link protocol.
//!
//! This module defines all error variants that can occur while linking nodes together,
//! from low-level I/O failures up to routing and request-level rejections.
//!
//! ## Error Categories
//! - **I/O Errors**: Socket and file system failures
//! - **Protocol Errors**: Schema violations, sequence gaps, illegal address pairs (connection-fatal)
//! - **Session Errors**: Invalidated or expired sessions, send buffer overflow, oversized frames
//! - **Request Errors**: Remote `responseError`s, permission denials, timeouts, lost connections
//! - **Configuration Errors**: Invalid or unreadable configuration
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use cluster_link::error::{ProtocolError, Result};
//! use std::fs::File;
//! use std::io::Read;
//! use tracing::{info, error};
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path).map_err(ProtocolError::Io)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents).map_err(ProtocolError::Io)?;
//!     Ok(contents)
//! }
//!
//! fn main() {
//!     match read_file("example.txt") {
//!         Ok(contents) => info!(contents, "Successfully read file"),
//!         Err(e) => error!(error=%e, "Error reading file"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::core::address::Address;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Handshake errors
    pub const ERR_HANDSHAKE_CLOSED: &str = "Connection closed during handshake";
    pub const ERR_EXPECTED_HELLO: &str = "Expected hello after invalidate";
    pub const ERR_SESSION_LIMIT: &str = "Session limit reached";
    pub const ERR_REGISTRATION_REFUSED: &str = "Registration kind not accepted here";
    pub const ERR_RESUME_AHEAD: &str = "Resume acknowledges messages that were never sent";

    /// Link errors
    pub const ERR_MISSING_REQUEST_ID: &str = "Request or response without request_id";
    pub const ERR_NO_HANDLER: &str = "No handler registered for request";
    pub const ERR_NO_ROUTE: &str = "No route to destination";
    pub const ERR_SOURCE_MISMATCH: &str = "Message source is not reachable through this connection";
}

// ProtocolError is the primary error type for all link operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Session invalidated by peer")]
    SessionInvalidated,

    #[error("Session expired while resuming")]
    SessionExpired,

    #[error("Send buffer overflow ({0} unacknowledged messages)")]
    SendBufferOverflow(usize),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    #[error("Illegal address pair for {name}: {src} -> {dst}")]
    IllegalAddressPair {
        name: String,
        src: Address,
        dst: Address,
    },

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Remote(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Unexpected message type: {0}")]
    UnexpectedMessage(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
