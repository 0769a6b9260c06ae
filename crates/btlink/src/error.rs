//! Error types for the btlink library
//!
//! This module defines the transport-facing error type shared by the
//! command and data submission paths.

use thiserror::Error;

/// Errors that can occur when submitting packets to an HCI transport
#[derive(Error, Debug)]
pub enum HciError {
    #[error("no controller buffer space available")]
    NoBufferSpace,

    #[error("transport is closed")]
    TransportClosed,

    #[error("invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
