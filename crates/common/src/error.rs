//! Common error types

use protocol::ForeignAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a transport primitive that is expected to succeed
///
/// Expected outcomes such as a stalled or unplugged transfer are reported
/// through completion status codes, never through this type.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Endpoint {address:#04x} could not be opened: {reason}")]
    OpenEndpoint { address: u8, reason: String },

    #[error("Endpoint {address:#04x} ring could not be populated: {reason}")]
    PopulateRing { address: u8, reason: String },

    #[error("Transfer could not be posted on endpoint {address:#04x}: {reason}")]
    Post { address: u8, reason: String },

    #[error("Control transfer could not be submitted: {0}")]
    Control(String),

    #[error("Endpoint {address:#04x} is closed")]
    Closed { address: u8 },

    #[error("USB error: {0}")]
    Usb(String),
}

/// Failure of the foreign address-space mapping primitive
#[derive(Debug, Error)]
pub enum MapError {
    #[error("Failed to map {len:#x} bytes at {addr} of process {process}: {reason}")]
    Map {
        process: u64,
        addr: ForeignAddr,
        len: usize,
        reason: String,
    },

    #[error("Failed to unmap {addr} of process {process}: {reason}")]
    Unmap {
        process: u64,
        addr: ForeignAddr,
        reason: String,
    },

    #[error("Cache maintenance failed for {addr} of process {process}: {reason}")]
    Cache {
        process: u64,
        addr: ForeignAddr,
        reason: String,
    },

    #[error("No mapping is active")]
    NotMapped,

    #[error("A mapping is already active")]
    AlreadyMapped,
}
